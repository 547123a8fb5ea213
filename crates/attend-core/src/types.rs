use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Map a box found on a downsampled frame back to full-frame coordinates.
    pub fn scaled(&self, factor: f32) -> BoundingBox {
        BoundingBox {
            x: self.x * factor,
            y: self.y * factor,
            width: self.width * factor,
            height: self.height * factor,
            confidence: self.confidence,
            landmarks: self
                .landmarks
                .map(|lms| lms.map(|(lx, ly)| (lx * factor, ly * factor))),
        }
    }

    /// Intersection-over-Union with another box. Degenerate boxes give 0.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union_area = self.width * self.height + other.width * other.height - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

/// Face embedding vector produced by the face extractor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Vectors of different length come from different extractors and are
    /// not comparable: the distance is `+inf` so they can never match.
    pub fn distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

/// One reference face of a known person. Several entries may share an identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub identity: String,
    pub embedding: Embedding,
}

/// A face found by the extractor in one frame.
#[derive(Debug, Clone)]
pub struct Detection {
    pub location: BoundingBox,
    pub embedding: Embedding,
}

/// Per-frame identity label. Serializes as the identity string or `"Unknown"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Label {
    Known(String),
    Unknown,
}

impl Label {
    pub fn identity(&self) -> Option<&str> {
        match self {
            Label::Known(name) => Some(name),
            Label::Unknown => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Label::Known(_))
    }
}

impl Serialize for Label {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Label::Known(name) => f.write_str(name),
            Label::Unknown => f.write_str("Unknown"),
        }
    }
}

/// Result of classifying one detection against the gallery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub slot_index: usize,
    pub label: Label,
    /// Distance to the nearest gallery entry; `+inf` for an empty gallery.
    pub distance: f32,
}

/// Key of a stabilizer history. Produced by a [`TrackAssigner`](crate::tracking::TrackAssigner).
pub type TrackId = u64;

/// Stabilized state of one track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "label", rename_all = "snake_case")]
pub enum Decision {
    Processing,
    Confirmed(Label),
}

impl Decision {
    /// Identity to record, if this decision confirms a known person.
    pub fn confirmed_identity(&self) -> Option<&str> {
        match self {
            Decision::Confirmed(label) => label.identity(),
            Decision::Processing => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StableDecision {
    pub track: TrackId,
    pub decision: Decision,
}

/// How an attendance record was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Camera,
    External,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Camera => "camera",
            Method::External => "external",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "camera" => Some(Method::Camera),
            "external" => Some(Method::External),
            _ => None,
        }
    }
}

/// One durable attendance row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub identity: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub method: Method,
}

impl AttendanceRecord {
    pub fn new(identity: impl Into<String>, at: NaiveDateTime, method: Method) -> Self {
        Self {
            identity: identity.into(),
            date: at.date(),
            // Ledger rows carry whole seconds.
            time: at.time().with_nanosecond(0).unwrap_or(at.time()),
            method,
        }
    }
}

/// A decoded grayscale frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
}

impl Frame {
    /// Box-average downsample by an integer factor. Factors of 0 or 1 return a copy.
    pub fn downsample(&self, factor: u32) -> Frame {
        if factor <= 1 {
            return self.clone();
        }
        let out_w = (self.width / factor).max(1);
        let out_h = (self.height / factor).max(1);
        let w = self.width as usize;
        let f = factor as usize;
        let mut data = Vec::with_capacity((out_w * out_h) as usize);

        for oy in 0..out_h as usize {
            for ox in 0..out_w as usize {
                let mut sum = 0u32;
                let mut count = 0u32;
                for y in oy * f..((oy + 1) * f).min(self.height as usize) {
                    for x in ox * f..((ox + 1) * f).min(w) {
                        if let Some(&p) = self.data.get(y * w + x) {
                            sum += p as u32;
                            count += 1;
                        }
                    }
                }
                data.push(if count > 0 { (sum / count) as u8 } else { 0 });
            }
        }

        Frame {
            data,
            width: out_w,
            height: out_h,
            sequence: self.sequence,
        }
    }
}
