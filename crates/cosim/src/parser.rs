//! Extracts the detection result from the simulation's diagnostic stream.
//!
//! The stream is arbitrary log text with two embedded single-line markers:
//!
//! - `Face detected at (<x>, <y>)`
//! - `VPI: Received Result: <Label> (confidence: <NN.NN>%)`
//!
//! Markers are matched anywhere in the text, in any order; the first match of
//! each wins. A missing or misshapen emotion marker, including one naming a
//! label outside the vocabulary, leaves the classification absent. Numbers
//! that do not parse are an error.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::protocol::{Classification, EmotionLabel, ResponseError};

static DETECTION_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Face detected at \(([^,()\n]*), ([^()\n]*)\)").expect("valid regex"));

static EMOTION_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"VPI: Received Result: ([^\r\n]*)").expect("valid regex"));

/// Fields recovered from the diagnostic text. Everything except `detected`
/// is optional.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParsedResult {
    pub detected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub box_x: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub box_y: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub emotion_label: Option<EmotionLabel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl ParsedResult {
    fn not_detected() -> Self {
        Self {
            detected: false,
            box_x: None,
            box_y: None,
            emotion_label: None,
            confidence: None,
        }
    }

    pub fn classification(&self) -> Option<Classification> {
        match (self.emotion_label, self.confidence) {
            (Some(label), Some(confidence)) => Some(Classification { label, confidence }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("face marker coordinate {0:?} is not a non-negative integer")]
    Coordinate(String),

    #[error("emotion marker: {0}")]
    Emotion(ResponseError),
}

/// True when the text contains a detection marker.
pub fn has_detection_marker(text: &str) -> bool {
    DETECTION_MARKER.is_match(text)
}

/// Parse the combined diagnostic text of one simulation run.
pub fn parse(text: &str) -> Result<ParsedResult, ParseError> {
    let Some(face) = DETECTION_MARKER.captures(text) else {
        return Ok(ParsedResult::not_detected());
    };

    let x = parse_coordinate(&face[1])?;
    let y = parse_coordinate(&face[2])?;

    let classification = match EMOTION_MARKER.captures(text) {
        Some(emotion) => match emotion[1].parse::<Classification>() {
            Ok(c) => Some(c),
            Err(e) if e.is_field_error() => return Err(ParseError::Emotion(e)),
            Err(e) => {
                tracing::debug!(error = %e, "Emotion marker present but malformed");
                None
            }
        },
        None => None,
    };

    Ok(ParsedResult {
        detected: true,
        box_x: Some(x),
        box_y: Some(y),
        emotion_label: classification.map(|c| c.label),
        confidence: classification.map(|c| c.confidence),
    })
}

fn parse_coordinate(raw: &str) -> Result<u32, ParseError> {
    raw.trim()
        .parse()
        .map_err(|_| ParseError::Coordinate(raw.to_string()))
}
