//! Track assignment: maps each detection in a frame to a stabilizer key.
//!
//! [`PositionalAssigner`] keys histories by detection order, so a key is
//! only meaningful while the faces in view keep their order.
//! [`IouAssigner`] follows boxes across sampled frames by overlap.

use crate::types::{BoundingBox, TrackId};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MIN_IOU: f32 = 0.3;
pub const DEFAULT_MAX_MISSED: u32 = 3;

/// Track ids for one frame's detections, plus tracks that ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackAssignment {
    /// One id per detection, same order as the input boxes.
    pub ids: Vec<TrackId>,
    /// Tracks whose histories should be dropped.
    pub retired: Vec<TrackId>,
}

pub trait TrackAssigner: Send {
    fn assign(&mut self, boxes: &[BoundingBox]) -> TrackAssignment;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerKind {
    Positional,
    Iou,
}

impl TrackerKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "positional" => Some(TrackerKind::Positional),
            "iou" => Some(TrackerKind::Iou),
            _ => None,
        }
    }

    pub fn build(self) -> Box<dyn TrackAssigner> {
        match self {
            TrackerKind::Positional => Box::new(PositionalAssigner),
            TrackerKind::Iou => Box::new(IouAssigner::new(DEFAULT_MIN_IOU, DEFAULT_MAX_MISSED)),
        }
    }
}

/// The i-th detection gets track id i. Never retires anything.
#[derive(Debug, Default)]
pub struct PositionalAssigner;

impl TrackAssigner for PositionalAssigner {
    fn assign(&mut self, boxes: &[BoundingBox]) -> TrackAssignment {
        TrackAssignment {
            ids: (0..boxes.len() as TrackId).collect(),
            retired: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
struct Track {
    id: TrackId,
    last_box: BoundingBox,
    missed: u32,
}

/// Greedy IoU association against the boxes of the previous sampled frames.
#[derive(Debug)]
pub struct IouAssigner {
    min_iou: f32,
    max_missed: u32,
    tracks: Vec<Track>,
    next_id: TrackId,
}

impl IouAssigner {
    pub fn new(min_iou: f32, max_missed: u32) -> Self {
        Self {
            min_iou,
            max_missed,
            tracks: Vec::new(),
            next_id: 0,
        }
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }
}

impl TrackAssigner for IouAssigner {
    fn assign(&mut self, boxes: &[BoundingBox]) -> TrackAssignment {
        // All candidate pairs above the overlap floor, best first.
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (bi, b) in boxes.iter().enumerate() {
                let overlap = track.last_box.iou(b);
                if overlap >= self.min_iou {
                    pairs.push((overlap, ti, bi));
                }
            }
        }
        pairs.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });

        let mut box_track: Vec<Option<usize>> = vec![None; boxes.len()];
        let mut track_taken = vec![false; self.tracks.len()];
        for (_, ti, bi) in pairs {
            if track_taken[ti] || box_track[bi].is_some() {
                continue;
            }
            track_taken[ti] = true;
            box_track[bi] = Some(ti);
        }

        let mut ids = Vec::with_capacity(boxes.len());
        let mut fresh = Vec::new();
        for (bi, b) in boxes.iter().enumerate() {
            match box_track[bi] {
                Some(ti) => {
                    let track = &mut self.tracks[ti];
                    track.last_box = b.clone();
                    track.missed = 0;
                    ids.push(track.id);
                }
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    fresh.push(Track {
                        id,
                        last_box: b.clone(),
                        missed: 0,
                    });
                    ids.push(id);
                }
            }
        }

        let mut retired = Vec::new();
        for (ti, track) in self.tracks.iter_mut().enumerate() {
            if !track_taken[ti] {
                track.missed += 1;
                if track.missed > self.max_missed {
                    retired.push(track.id);
                }
            }
        }
        self.tracks.retain(|t| t.missed <= self.max_missed);
        self.tracks.extend(fresh);

        if !retired.is_empty() {
            tracing::debug!(?retired, "retired tracks");
        }

        TrackAssignment { ids, retired }
    }
}
