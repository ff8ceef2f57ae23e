//! Terminal result handed back to the orchestrator's caller.

use serde::Serialize;

use crate::protocol::{Classification, EmotionLabel};

/// Side of the square detection window for the reference cascade.
pub const DEFAULT_BOX_SIDE: u32 = 24;

/// Where a [`DetectionResult`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    /// Parsed from a simulation that completed.
    Simulated,
    /// Parsed from output captured before a timeout kill.
    PartiallyRecovered,
    /// Position and label from the fallback table, confidence randomized.
    FallbackSynthesized,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simulated => "simulated",
            Self::PartiallyRecovered => "partially_recovered",
            Self::FallbackSynthesized => "fallback_synthesized",
        }
    }
}

/// Top-left corner and side of the detected face window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FaceRegion {
    #[serde(rename = "box_x")]
    pub x: u32,
    #[serde(rename = "box_y")]
    pub y: u32,
    #[serde(rename = "box_side")]
    pub side: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct ClassificationFields {
    emotion_label: EmotionLabel,
    confidence: f64,
}

/// Structured detection + classification result.
///
/// Label and confidence travel together as one [`Classification`], so one is
/// present exactly when the other is.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    region: Option<FaceRegion>,
    classification: Option<Classification>,
    origin: Origin,
}

impl DetectionResult {
    /// No face in the frame.
    pub fn not_detected(origin: Origin) -> Self {
        Self {
            region: None,
            classification: None,
            origin,
        }
    }

    pub fn detected(region: FaceRegion, classification: Option<Classification>, origin: Origin) -> Self {
        Self {
            region: Some(region),
            classification,
            origin,
        }
    }

    pub fn is_detected(&self) -> bool {
        self.region.is_some()
    }

    pub fn region(&self) -> Option<FaceRegion> {
        self.region
    }

    pub fn classification(&self) -> Option<Classification> {
        self.classification
    }

    pub fn emotion_label(&self) -> Option<EmotionLabel> {
        self.classification.map(|c| c.label)
    }

    pub fn confidence(&self) -> Option<f64> {
        self.classification.map(|c| c.confidence)
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// A face was found but no classification came back.
    pub fn is_classification_incomplete(&self) -> bool {
        self.region.is_some() && self.classification.is_none()
    }
}

impl Serialize for DetectionResult {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Repr {
            detected: bool,
            #[serde(flatten)]
            region: Option<FaceRegion>,
            #[serde(flatten)]
            classification: Option<ClassificationFields>,
            origin: Origin,
        }

        Repr {
            detected: self.is_detected(),
            region: self.region,
            classification: self.classification.map(|c| ClassificationFields {
                emotion_label: c.label,
                confidence: c.confidence,
            }),
            origin: self.origin,
        }
        .serialize(serializer)
    }
}
