//! Wire types for the ROI/classification protocol.
//!
//! Request header: `ROI <x> <y> <w> <h>\n`, optionally followed by `w*h` raw
//! pixel bytes. Response: `<Label> (confidence: <NN.NN>%)\n`. One pair per
//! connection, no length prefix.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Command token that opens every request header.
pub const ROI_COMMAND: &str = "ROI";

/// Fixed emotion vocabulary shared by the service, the parser and the
/// fallback table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmotionLabel {
    Happy,
    Sad,
    Neutral,
    Surprise,
    Angry,
    Fear,
    Disgust,
}

impl EmotionLabel {
    pub const ALL: [EmotionLabel; 7] = [
        EmotionLabel::Happy,
        EmotionLabel::Sad,
        EmotionLabel::Neutral,
        EmotionLabel::Surprise,
        EmotionLabel::Angry,
        EmotionLabel::Fear,
        EmotionLabel::Disgust,
    ];

    /// Labels the mock backend draws from.
    pub const MOCK: [EmotionLabel; 5] = [
        EmotionLabel::Happy,
        EmotionLabel::Sad,
        EmotionLabel::Neutral,
        EmotionLabel::Surprise,
        EmotionLabel::Angry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Happy => "Happy",
            Self::Sad => "Sad",
            Self::Neutral => "Neutral",
            Self::Surprise => "Surprise",
            Self::Angry => "Angry",
            Self::Fear => "Fear",
            Self::Disgust => "Disgust",
        }
    }
}

impl fmt::Display for EmotionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown emotion label: {0:?}")]
pub struct UnknownLabel(pub String);

impl FromStr for EmotionLabel {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|label| label.as_str() == s)
            .ok_or_else(|| UnknownLabel(s.to_string()))
    }
}

/// ROI request header plus the optional pixel payload that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoiRequest {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub payload: Option<Vec<u8>>,
}

impl RoiRequest {
    pub fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self {
            x,
            y,
            w,
            h,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Number of payload bytes announced by the header (`w*h`).
    pub fn payload_len(&self) -> u64 {
        u64::from(self.w) * u64::from(self.h)
    }

    /// Header line including the trailing newline.
    pub fn header_line(&self) -> String {
        format!("{ROI_COMMAND} {} {} {} {}\n", self.x, self.y, self.w, self.h)
    }

    /// Parse a header line (trailing `\r`/`\n` tolerated). The payload is
    /// never part of the header, so the result has `payload: None`.
    pub fn parse_header(line: &str) -> Result<Self, HeaderError> {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some(ROI_COMMAND) => {}
            Some(other) => return Err(HeaderError::UnknownCommand(other.to_string())),
            None => return Err(HeaderError::UnknownCommand(String::new())),
        }

        let fields: Vec<&str> = parts.collect();
        if fields.len() != 4 {
            return Err(HeaderError::FieldCount(fields.len()));
        }

        let mut values = [0u32; 4];
        for (slot, field) in values.iter_mut().zip(&fields) {
            *slot = field
                .parse()
                .map_err(|_| HeaderError::InvalidField(field.to_string()))?;
        }

        let [x, y, w, h] = values;
        Ok(Self::new(x, y, w, h))
    }
}

/// Reasons a request header is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("unknown command: {0:?}")]
    UnknownCommand(String),

    #[error("malformed ROI header: expected 4 fields, got {0}")]
    FieldCount(usize),

    #[error("malformed ROI header: {0:?} is not a non-negative integer")]
    InvalidField(String),
}

/// A label with its confidence percentage. This is both the backend's
/// prediction and the service's response line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: EmotionLabel,
    pub confidence: f64,
}

pub type ClassificationResponse = Classification;

impl Classification {
    /// Build a classification, rejecting confidences outside `[0, 100]`.
    pub fn new(label: EmotionLabel, confidence: f64) -> Result<Self, ResponseError> {
        if !(0.0..=100.0).contains(&confidence) {
            return Err(ResponseError::ConfidenceRange(confidence));
        }
        Ok(Self { label, confidence })
    }

    /// Response line including the trailing newline.
    pub fn response_line(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (confidence: {:.2}%)", self.label, self.confidence)
    }
}

/// Reasons a response line does not parse.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResponseError {
    #[error("response does not match `<Label> (confidence: <NN.NN>%)`: {0:?}")]
    Shape(String),

    #[error(transparent)]
    Label(#[from] UnknownLabel),

    #[error("confidence {0:?} is not a number")]
    ConfidenceValue(String),

    #[error("confidence {0} is outside [0, 100]")]
    ConfidenceRange(f64),
}

impl ResponseError {
    /// True when the line has the right shape but its confidence is not a
    /// usable number. An unrecognised label counts as a mismatch, not a
    /// field error.
    pub fn is_field_error(&self) -> bool {
        matches!(self, Self::ConfidenceValue(_) | Self::ConfidenceRange(_))
    }
}

impl FromStr for Classification {
    type Err = ResponseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim_end_matches(['\r', '\n']).trim();
        let shape = || ResponseError::Shape(line.to_string());

        let (label, rest) = line.split_once(" (confidence: ").ok_or_else(shape)?;
        let value = rest.strip_suffix("%)").ok_or_else(shape)?;
        if label.is_empty() || label.contains(char::is_whitespace) {
            return Err(shape());
        }

        let label: EmotionLabel = label.parse()?;
        let confidence: f64 = value
            .trim()
            .parse()
            .map_err(|_| ResponseError::ConfidenceValue(value.to_string()))?;
        if !confidence.is_finite() {
            return Err(ResponseError::ConfidenceValue(value.to_string()));
        }
        Self::new(label, confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_parses_four_fields() {
        let req = RoiRequest::parse_header("ROI 10 10 48 48\n").unwrap();
        assert_eq!(req, RoiRequest::new(10, 10, 48, 48));
        assert_eq!(req.payload_len(), 48 * 48);
    }

    #[test]
    fn header_rejects_unknown_command() {
        assert_eq!(
            RoiRequest::parse_header("HELLO 1 2 3 4"),
            Err(HeaderError::UnknownCommand("HELLO".to_string()))
        );
        assert!(matches!(
            RoiRequest::parse_header(""),
            Err(HeaderError::UnknownCommand(_))
        ));
    }

    #[test]
    fn header_rejects_wrong_field_count() {
        assert_eq!(
            RoiRequest::parse_header("ROI 1 2 3"),
            Err(HeaderError::FieldCount(3))
        );
        assert_eq!(
            RoiRequest::parse_header("ROI 1 2 3 4 5"),
            Err(HeaderError::FieldCount(5))
        );
    }

    #[test]
    fn header_rejects_negative_and_non_numeric() {
        assert_eq!(
            RoiRequest::parse_header("ROI -1 2 3 4"),
            Err(HeaderError::InvalidField("-1".to_string()))
        );
        assert_eq!(
            RoiRequest::parse_header("ROI 1 two 3 4"),
            Err(HeaderError::InvalidField("two".to_string()))
        );
    }

    #[test]
    fn header_line_format() {
        assert_eq!(RoiRequest::new(24, 20, 24, 24).header_line(), "ROI 24 20 24 24\n");
    }

    #[test]
    fn response_formats_two_decimals() {
        let c = Classification::new(EmotionLabel::Happy, 91.2345).unwrap();
        assert_eq!(c.response_line(), "Happy (confidence: 91.23%)\n");
    }

    #[test]
    fn response_parses() {
        let c: Classification = "Surprise (confidence: 80.50%)\n".parse().unwrap();
        assert_eq!(c.label, EmotionLabel::Surprise);
        assert!((c.confidence - 80.5).abs() < 1e-9);
    }

    #[test]
    fn response_shape_errors_are_not_field_errors() {
        let err = "Happy 91%".parse::<Classification>().unwrap_err();
        assert!(!err.is_field_error());

        let err = "Happy (confidence: abc%)".parse::<Classification>().unwrap_err();
        assert!(err.is_field_error());
        assert!(matches!(err, ResponseError::ConfidenceValue(_)));

        let err = "Bored (confidence: 50.00%)".parse::<Classification>().unwrap_err();
        assert!(matches!(err, ResponseError::Label(_)));
        assert!(!err.is_field_error());

        let err = "Sad (confidence: 120.00%)".parse::<Classification>().unwrap_err();
        assert!(matches!(err, ResponseError::ConfidenceRange(_)));
        assert!(err.is_field_error());
    }

    #[test]
    fn label_roundtrips_through_str() {
        for label in EmotionLabel::ALL {
            assert_eq!(label.as_str().parse::<EmotionLabel>().unwrap(), label);
        }
    }

    #[test]
    fn classification_serializes() {
        let c = Classification::new(EmotionLabel::Fear, 61.5).unwrap();
        insta::assert_json_snapshot!(c, @r#"
        {
          "label": "Fear",
          "confidence": 61.5
        }
        "#);
    }
}
