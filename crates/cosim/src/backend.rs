//! Classification backends.
//!
//! The service holds one `Arc<dyn Classifier>` chosen at startup: either the
//! randomized [`MockClassifier`] or a [`ModelClassifier`] loaded from disk.
//! [`select_backend`] falls back to the mock when the model cannot be loaded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use serde::Deserialize;

use crate::protocol::{Classification, EmotionLabel, RoiRequest};

/// Pluggable predictor behind the classification service.
pub trait Classifier: Send + Sync + 'static {
    /// Classify one region of interest.
    fn predict(&self, request: &RoiRequest) -> Classification;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

/// Uniformly random label from [`EmotionLabel::MOCK`], confidence in
/// `[80.00, 99.90)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MockClassifier;

impl MockClassifier {
    pub fn predict_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> Classification {
        let label = EmotionLabel::MOCK[rng.gen_range(0..EmotionLabel::MOCK.len())];
        // Drawn in hundredths so the two-decimal wire form stays below 99.90.
        let hundredths: u32 = rng.gen_range(8000..9990);
        Classification {
            label,
            confidence: f64::from(hundredths) / 100.0,
        }
    }
}

impl Classifier for MockClassifier {
    fn predict(&self, _request: &RoiRequest) -> Classification {
        self.predict_with_rng(&mut rand::thread_rng())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("failed to read model {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse model {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid model: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
struct ModelFile {
    labels: Vec<String>,
    input_size: usize,
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
}

/// Linear softmax classifier over the ROI pixel payload.
///
/// The payload is resampled to `input_size` values scaled to `[0, 1]`; a
/// request without payload is classified from a zero vector.
#[derive(Debug, Clone)]
pub struct ModelClassifier {
    labels: Vec<EmotionLabel>,
    input_size: usize,
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
}

impl ModelClassifier {
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let raw = std::fs::read(path).map_err(|source| ModelLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: ModelFile = serde_json::from_slice(&raw).map_err(|source| ModelLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_parts(file)
    }

    fn from_parts(file: ModelFile) -> Result<Self, ModelLoadError> {
        if file.labels.is_empty() {
            return Err(ModelLoadError::Invalid("no labels".to_string()));
        }
        if file.input_size == 0 {
            return Err(ModelLoadError::Invalid("input_size must be positive".to_string()));
        }
        if file.weights.len() != file.labels.len() || file.bias.len() != file.labels.len() {
            return Err(ModelLoadError::Invalid(format!(
                "{} labels but {} weight rows and {} biases",
                file.labels.len(),
                file.weights.len(),
                file.bias.len()
            )));
        }
        if let Some(row) = file.weights.iter().position(|w| w.len() != file.input_size) {
            return Err(ModelLoadError::Invalid(format!(
                "weight row {row} does not have input_size={} columns",
                file.input_size
            )));
        }
        let labels = file
            .labels
            .iter()
            .map(|l| l.parse::<EmotionLabel>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ModelLoadError::Invalid(e.to_string()))?;

        Ok(Self {
            labels,
            input_size: file.input_size,
            weights: file.weights,
            bias: file.bias,
        })
    }

    fn features(&self, payload: Option<&[u8]>) -> Vec<f64> {
        match payload {
            Some(bytes) if !bytes.is_empty() => (0..self.input_size)
                .map(|i| {
                    let src = i * bytes.len() / self.input_size;
                    f64::from(bytes[src]) / 255.0
                })
                .collect(),
            _ => vec![0.0; self.input_size],
        }
    }

    /// Class probabilities in label order.
    pub fn probabilities(&self, payload: Option<&[u8]>) -> Vec<f64> {
        let x = self.features(payload);
        let logits: Vec<f64> = self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(&x).map(|(w, v)| w * v).sum::<f64>() + b)
            .collect();

        let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let exp: Vec<f64> = logits.iter().map(|l| (l - max).exp()).collect();
        let total: f64 = exp.iter().sum();
        exp.into_iter().map(|e| e / total).collect()
    }
}

impl Classifier for ModelClassifier {
    fn predict(&self, request: &RoiRequest) -> Classification {
        let probs = self.probabilities(request.payload.as_deref());
        let (best, p) = probs
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });
        Classification {
            label: self.labels[best],
            confidence: (p * 100.0).clamp(0.0, 100.0),
        }
    }

    fn name(&self) -> &'static str {
        "model"
    }
}

/// Pick the backend for a service instance. A model that fails to load is
/// logged and replaced by the mock; startup never fails here.
pub fn select_backend(model: Option<&Path>) -> Arc<dyn Classifier> {
    let Some(path) = model else {
        tracing::info!("No model provided, using mock classifier");
        return Arc::new(MockClassifier);
    };

    tracing::info!(path = %path.display(), "Loading model");
    match ModelClassifier::load(path) {
        Ok(model) => {
            tracing::info!(labels = model.labels.len(), input_size = model.input_size, "Model loaded");
            Arc::new(model)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Model load failed, falling back to mock classifier");
            Arc::new(MockClassifier)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn write_model(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("model.json");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn mock_stays_in_vocabulary_and_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..1000 {
            let c = MockClassifier.predict_with_rng(&mut rng);
            assert!(EmotionLabel::MOCK.contains(&c.label));
            assert!((80.0..99.9).contains(&c.confidence), "{}", c.confidence);
            let wire: Classification = c.to_string().parse().unwrap();
            assert!(wire.confidence < 99.9);
        }
    }

    #[test]
    fn model_reports_argmax_probability() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_model(
            &dir,
            r#"{"labels":["Sad","Happy"],"input_size":2,"weights":[[0,0],[4,4]],"bias":[0,0]}"#,
        );
        let model = ModelClassifier::load(&path).unwrap();

        let bright = RoiRequest::new(0, 0, 2, 2).with_payload(vec![255; 4]);
        let c = model.predict(&bright);
        assert_eq!(c.label, EmotionLabel::Happy);
        let expected = 100.0 * 8f64.exp() / (1.0 + 8f64.exp());
        assert!((c.confidence - expected).abs() < 1e-9);

        // No payload: all logits equal, first label wins at 50%.
        let c = model.predict(&RoiRequest::new(0, 0, 2, 2));
        assert_eq!(c.label, EmotionLabel::Sad);
        assert!((c.confidence - 50.0).abs() < 1e-9);
    }

    #[test]
    fn model_rejects_shape_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_model(
            &dir,
            r#"{"labels":["Sad","Happy"],"input_size":3,"weights":[[0,0,0]],"bias":[0,0]}"#,
        );
        assert!(matches!(
            ModelClassifier::load(&path),
            Err(ModelLoadError::Invalid(_))
        ));
    }

    #[test]
    fn model_rejects_unknown_label() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_model(
            &dir,
            r#"{"labels":["Bored"],"input_size":1,"weights":[[1]],"bias":[0]}"#,
        );
        assert!(matches!(
            ModelClassifier::load(&path),
            Err(ModelLoadError::Invalid(_))
        ));
    }

    #[test]
    fn select_backend_falls_back_to_mock() {
        let backend = select_backend(Some(Path::new("/nonexistent/model.json")));
        assert_eq!(backend.name(), "mock");
        assert_eq!(select_backend(None).name(), "mock");
    }
}
