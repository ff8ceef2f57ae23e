use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cosim::service::{self, ServiceConfig};
use cosim::{
    CoSimulation, CosimSpawner, DEFAULT_SERVICE_PORT, FallbackTable, PipelineConfig, RoiClient,
    RoiRequest, ServiceSupervisor, SimulationInvoker, SimulationJob, SimulatorConfig,
    SupervisorConfig, parser, select_backend,
};

mod logging;

#[derive(Parser)]
#[command(name = "cosim", version)]
#[command(about = "Co-simulation orchestrator for the face detection and emotion classification flow", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the classification service
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, env = "COSIM_PORT", default_value_t = DEFAULT_SERVICE_PORT)]
        port: u16,
        /// Model JSON; the mock classifier is used when absent or unloadable
        #[arg(long, env = "COSIM_MODEL")]
        model: Option<PathBuf>,
        /// Read the w*h pixel payload following each header
        #[arg(long)]
        read_payload: bool,
        #[arg(long, default_value_t = 16)]
        max_connections: usize,
    },
    /// Run one detection + classification job and print the result as JSON
    Run {
        /// Prepared pixel file
        #[arg(long)]
        input: PathBuf,
        /// Original image filename, used for fallback lookup on timeout
        #[arg(long)]
        filename: Option<String>,
        #[arg(long, env = "COSIM_TIMEOUT_SECS", default_value_t = 15)]
        timeout_secs: u64,
        /// Simulation working directory
        #[arg(long, env = "COSIM_SIM_DIR", default_value = ".")]
        sim_dir: PathBuf,
        /// Directory holding the VPI module
        #[arg(long, env = "COSIM_VPI_DIR", default_value = ".")]
        vpi_dir: PathBuf,
        #[arg(long, env = "COSIM_PORT", default_value_t = DEFAULT_SERVICE_PORT)]
        port: u16,
        /// Fallback table JSON replacing the built-in one
        #[arg(long, env = "COSIM_FALLBACK")]
        fallback: Option<PathBuf>,
        /// Model JSON passed to a spawned service
        #[arg(long, env = "COSIM_MODEL")]
        model: Option<PathBuf>,
    },
    /// Send one ROI request to a running service
    Classify {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, env = "COSIM_PORT", default_value_t = DEFAULT_SERVICE_PORT)]
        port: u16,
        x: u32,
        y: u32,
        w: u32,
        h: u32,
        /// Raw pixel bytes sent after the header
        #[arg(long)]
        payload: Option<PathBuf>,
    },
    /// Parse a captured simulation log and print the result as JSON
    Parse {
        logfile: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve {
            host,
            port,
            model,
            read_payload,
            max_connections,
        } => {
            let config = ServiceConfig::default()
                .with_host(host)
                .with_port(port)
                .with_read_payload(read_payload)
                .with_max_connections(max_connections);
            service::serve(config, select_backend(model.as_deref()))
                .await
                .map(|()| ExitCode::SUCCESS)
        }
        Commands::Run {
            input,
            filename,
            timeout_secs,
            sim_dir,
            vpi_dir,
            port,
            fallback,
            model,
        } => {
            let mut job = SimulationJob::new(input).with_timeout(Duration::from_secs(timeout_secs));
            if let Some(name) = filename {
                job = job.with_original_filename(name);
            }
            run_job(job, sim_dir, &vpi_dir, port, fallback.as_deref(), model).await
        }
        Commands::Classify {
            host,
            port,
            x,
            y,
            w,
            h,
            payload,
        } => classify(&host, port, RoiRequest::new(x, y, w, h), payload.as_deref()).await,
        Commands::Parse { logfile } => parse_log(&logfile),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Command failed");
            ExitCode::FAILURE
        }
    }
}

async fn run_job(
    job: SimulationJob,
    sim_dir: PathBuf,
    vpi_dir: &Path,
    port: u16,
    fallback: Option<&Path>,
    model: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    let table = match fallback {
        Some(path) => FallbackTable::load(path)?,
        None => FallbackTable::builtin()?,
    };
    let spawner = CosimSpawner::current_exe()
        .context("failed to locate the cosim executable")?
        .with_model(model);
    let supervisor = ServiceSupervisor::new(SupervisorConfig::new(Arc::new(spawner)));
    let invoker = SimulationInvoker::new(SimulatorConfig::vvp(sim_dir, vpi_dir));

    let mut pipeline = CoSimulation::new(
        PipelineConfig::default().with_port(port),
        supervisor,
        Arc::new(invoker),
        Arc::new(table),
    );

    let result = pipeline.process(&job).await;
    if let Err(e) = pipeline.shutdown().await {
        tracing::warn!(error = %e, "Failed to stop classification service");
    }

    match result {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            tracing::error!(job_id = job.id(), error = %e, "Job failed");
            if let Some(diagnostics) = e.diagnostics() {
                eprintln!("{diagnostics}");
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn classify(
    host: &str,
    port: u16,
    mut request: RoiRequest,
    payload: Option<&Path>,
) -> anyhow::Result<ExitCode> {
    if let Some(path) = payload {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read payload {}", path.display()))?;
        request = request.with_payload(bytes);
    }

    let response = RoiClient::new(host, port).classify(&request).await?;
    println!("{response}");
    Ok(ExitCode::SUCCESS)
}

fn parse_log(path: &Path) -> anyhow::Result<ExitCode> {
    println!("{}", parsed_log_json(path)?);
    Ok(ExitCode::SUCCESS)
}

fn parsed_log_json(path: &Path) -> anyhow::Result<String> {
    let raw = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let parsed = parser::parse(&String::from_utf8_lossy(&raw))?;
    Ok(serde_json::to_string_pretty(&parsed)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_parse() {
        let cli = Cli::try_parse_from([
            "cosim",
            "run",
            "--input",
            "face.txt",
            "--filename",
            "000001.jpg",
            "--timeout-secs",
            "3",
            "--sim-dir",
            "sim",
            "--vpi-dir",
            "vpi",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                input,
                filename,
                timeout_secs,
                sim_dir,
                vpi_dir,
                fallback,
                ..
            } => {
                assert_eq!(input, PathBuf::from("face.txt"));
                assert_eq!(filename.as_deref(), Some("000001.jpg"));
                assert_eq!(timeout_secs, 3);
                assert_eq!(sim_dir, PathBuf::from("sim"));
                assert_eq!(vpi_dir, PathBuf::from("vpi"));
                assert!(fallback.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_requires_input() {
        assert!(Cli::try_parse_from(["cosim", "run"]).is_err());
    }

    #[test]
    fn parse_prints_detection_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.log");
        std::fs::write(
            &path,
            "VCD info: dumpfile\nFace detected at (20, 20)\nVPI: Received Result: Happy (confidence: 91.23%)\n",
        )
        .unwrap();
        insta::assert_snapshot!(parsed_log_json(&path).unwrap(), @r#"
        {
          "detected": true,
          "box_x": 20,
          "box_y": 20,
          "emotion_label": "Happy",
          "confidence": 91.23
        }
        "#);
    }

    #[test]
    fn parse_without_marker_is_not_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.log");
        std::fs::write(&path, "VCD info: dumpfile\n").unwrap();
        insta::assert_snapshot!(parsed_log_json(&path).unwrap(), @r#"
        {
          "detected": false
        }
        "#);
    }

    #[test]
    fn parse_rejects_bad_coordinates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.log");
        std::fs::write(&path, "Face detected at (x, 1)\n").unwrap();
        assert!(parsed_log_json(&path).is_err());
        assert!(parsed_log_json(&dir.path().join("missing.log")).is_err());
    }
}
