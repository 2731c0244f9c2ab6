use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::gate::GateKind;
use crate::plate::PlateCode;

/// Face descriptor vector (128-dimensional by default).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector {
    pub values: Vec<f32>,
}

impl FeatureVector {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance to another descriptor.
    ///
    /// Returns `None` when the dimensionalities differ; such pairs are not
    /// comparable and must be skipped by callers.
    pub fn euclidean_distance(&self, other: &FeatureVector) -> Option<f32> {
        if self.values.len() != other.values.len() {
            return None;
        }
        Some(
            self.values
                .iter()
                .zip(other.values.iter())
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f32>()
                .sqrt(),
        )
    }
}

/// A vehicle registered to a resident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub plate: PlateCode,
    pub model: String,
    pub color: Option<String>,
    pub parking_spot: Option<String>,
}

/// An enrolled resident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub name: String,
    pub apartment: String,
    pub block: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub vehicles: Vec<Vehicle>,
    /// Enrolled face descriptor. Residents without one can only be
    /// recognized by plate or registered manually.
    pub descriptor: Option<FeatureVector>,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    /// `"apartment/block"` label used in logs and listings.
    pub fn unit_label(&self) -> String {
        format!("{}/{}", self.apartment, self.block)
    }
}

/// Direction of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Entry,
    Exit,
}

impl Direction {
    /// Direction of the next registration given the identity's most recent one.
    ///
    /// Only a prior `Entry` flips to `Exit`; no history means `Entry`.
    pub fn following(last: Option<Direction>) -> Direction {
        match last {
            Some(Direction::Entry) => Direction::Exit,
            _ => Direction::Entry,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Entry => "entry",
            Direction::Exit => "exit",
        }
    }

    pub fn parse(s: &str) -> Option<Direction> {
        match s.trim().to_ascii_lowercase().as_str() {
            "entry" => Some(Direction::Entry),
            "exit" => Some(Direction::Exit),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an identity was recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionMethod {
    Facial,
    Plate(PlateCode),
    Manual { note: String },
}

impl RecognitionMethod {
    /// Label stored on the ledger entry.
    pub fn label(&self) -> String {
        match self {
            RecognitionMethod::Facial => "facial recognition".to_string(),
            RecognitionMethod::Plate(plate) => format!("plate recognition ({plate})"),
            RecognitionMethod::Manual { note } if note.is_empty() => "manual".to_string(),
            RecognitionMethod::Manual { note } => format!("manual ({note})"),
        }
    }

    /// Gate opened on an accepted entry through this method.
    pub fn gate(&self) -> Option<GateKind> {
        match self {
            RecognitionMethod::Facial => Some(GateKind::Pedestrian),
            RecognitionMethod::Plate(_) => Some(GateKind::Vehicle),
            RecognitionMethod::Manual { .. } => None,
        }
    }
}

/// One immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessRecord {
    pub id: Uuid,
    pub identity_id: Uuid,
    pub vehicle_id: Option<Uuid>,
    pub direction: Direction,
    pub method: String,
    pub recognized: bool,
    pub created_at: DateTime<Utc>,
}

impl AccessRecord {
    pub fn new(
        identity_id: Uuid,
        vehicle_id: Option<Uuid>,
        direction: Direction,
        method: &RecognitionMethod,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity_id,
            vehicle_id,
            direction,
            method: method.label(),
            recognized: true,
            created_at,
        }
    }
}

/// A 2D landmark position in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn distance(&self, other: &Point) -> f32 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Bounding box of a detected face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Width over height; zero for a degenerate box.
    pub fn aspect_ratio(&self) -> f32 {
        if self.height > 0.0 {
            self.width / self.height
        } else {
            0.0
        }
    }
}

/// One detected face in one frame, as produced by the feature extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSample {
    pub descriptor: FeatureVector,
    pub bbox: BoundingBox,
    /// Facial landmarks (68-point layout), in detector order.
    #[serde(default)]
    pub landmarks: Vec<Point>,
    /// Expression category scores (`neutral`, `happy`, `sad`, ...), if the
    /// extractor ran an expression head.
    #[serde(default)]
    pub expressions: Option<BTreeMap<String, f32>>,
}

/// One OCR text line with its location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrLine {
    pub text: String,
    #[serde(default)]
    pub bbox: Option<BoundingBox>,
}

/// Output of the text extractor for one frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    pub text: String,
    #[serde(default)]
    pub lines: Vec<OcrLine>,
    /// Engine confidence in [0, 1], when reported.
    #[serde(default)]
    pub confidence: Option<f32>,
}
