//! Temporal stabilization of per-frame labels.
//!
//! Each track keeps a FIFO of its last `history_len` labels. A track is
//! confirmed only once the window is full and the most frequent label
//! occurs at least `confirm_threshold` times. Ties on frequency go to the
//! label whose first occurrence in the window is earliest.

use crate::types::{Decision, Label, StableDecision, TrackId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

pub const DEFAULT_HISTORY_LEN: usize = 5;
pub const DEFAULT_CONFIRM_THRESHOLD: usize = 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum StabilizerError {
    #[error("history length must be at least 1")]
    EmptyWindow,
    #[error("confirmation threshold {threshold} must be between 1 and the history length {history_len}")]
    ThresholdOutOfRange { threshold: usize, history_len: usize },
}

/// Window size `H` and confirmation threshold `C`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StabilizerConfig {
    pub history_len: usize,
    pub confirm_threshold: usize,
}

impl Default for StabilizerConfig {
    fn default() -> Self {
        Self {
            history_len: DEFAULT_HISTORY_LEN,
            confirm_threshold: DEFAULT_CONFIRM_THRESHOLD,
        }
    }
}

impl StabilizerConfig {
    pub fn new(history_len: usize, confirm_threshold: usize) -> Result<Self, StabilizerError> {
        let config = Self {
            history_len,
            confirm_threshold,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), StabilizerError> {
        if self.history_len == 0 {
            return Err(StabilizerError::EmptyWindow);
        }
        if self.confirm_threshold == 0 || self.confirm_threshold > self.history_len {
            return Err(StabilizerError::ThresholdOutOfRange {
                threshold: self.confirm_threshold,
                history_len: self.history_len,
            });
        }
        Ok(())
    }
}

/// Rolling label window for one track.
#[derive(Debug, Clone)]
pub struct SlotHistory {
    labels: VecDeque<Label>,
    capacity: usize,
}

impl SlotHistory {
    fn new(capacity: usize) -> Self {
        Self {
            labels: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, label: Label) {
        if self.labels.len() == self.capacity {
            self.labels.pop_front();
        }
        self.labels.push_back(label);
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.labels.len() == self.capacity
    }

    /// Labels in arrival order, oldest first.
    pub fn labels(&self) -> impl Iterator<Item = &Label> {
        self.labels.iter()
    }

    /// Most frequent label and its count; earliest first occurrence wins ties.
    pub fn majority(&self) -> Option<(&Label, usize)> {
        // Tally in window order so the Vec keeps first-occurrence order.
        let mut tally: Vec<(&Label, usize)> = Vec::new();
        for label in &self.labels {
            match tally.iter_mut().find(|(l, _)| *l == label) {
                Some((_, count)) => *count += 1,
                None => tally.push((label, 1)),
            }
        }

        let mut best: Option<(&Label, usize)> = None;
        for (label, count) in tally {
            if best.map_or(true, |(_, c)| count > c) {
                best = Some((label, count));
            }
        }
        best
    }

    fn decide(&self, confirm_threshold: usize) -> Decision {
        if !self.is_full() {
            return Decision::Processing;
        }
        match self.majority() {
            Some((label, count)) if count >= confirm_threshold => {
                Decision::Confirmed(label.clone())
            }
            _ => Decision::Processing,
        }
    }
}

/// Majority-vote state machine over per-track label histories.
///
/// Histories must be fed in frame-arrival order per track.
#[derive(Debug)]
pub struct Stabilizer {
    config: StabilizerConfig,
    histories: HashMap<TrackId, SlotHistory>,
}

impl Stabilizer {
    pub fn new(config: StabilizerConfig) -> Result<Self, StabilizerError> {
        config.validate()?;
        Ok(Self {
            config,
            histories: HashMap::new(),
        })
    }

    pub fn config(&self) -> StabilizerConfig {
        self.config
    }

    /// Append the newest label for `track` and return its decision.
    pub fn observe(&mut self, track: TrackId, label: Label) -> Decision {
        let capacity = self.config.history_len;
        let history = self
            .histories
            .entry(track)
            .or_insert_with(|| SlotHistory::new(capacity));
        history.push(label);
        history.decide(self.config.confirm_threshold)
    }

    /// Observe every track present in one classified frame.
    pub fn observe_frame(&mut self, labels: &[(TrackId, Label)]) -> Vec<StableDecision> {
        labels
            .iter()
            .map(|(track, label)| StableDecision {
                track: *track,
                decision: self.observe(*track, label.clone()),
            })
            .collect()
    }

    /// Current decision for a track without adding evidence.
    pub fn decision(&self, track: TrackId) -> Decision {
        self.histories
            .get(&track)
            .map(|h| h.decide(self.config.confirm_threshold))
            .unwrap_or(Decision::Processing)
    }

    pub fn history(&self, track: TrackId) -> Option<&SlotHistory> {
        self.histories.get(&track)
    }

    /// Drop the history of a track that is no longer visible.
    pub fn forget(&mut self, track: TrackId) {
        if self.histories.remove(&track).is_some() {
            tracing::trace!(track, "dropped track history");
        }
    }

    pub fn active_tracks(&self) -> Vec<TrackId> {
        let mut tracks: Vec<TrackId> = self.histories.keys().copied().collect();
        tracks.sort_unstable();
        tracks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Label {
        Label::Known("Alice".into())
    }

    fn bob() -> Label {
        Label::Known("Bob".into())
    }

    fn feed(stabilizer: &mut Stabilizer, track: TrackId, labels: &[Label]) -> Vec<Decision> {
        labels
            .iter()
            .map(|l| stabilizer.observe(track, l.clone()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = StabilizerConfig::default();
        assert_eq!(config.history_len, 5);
        assert_eq!(config.confirm_threshold, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_bad_threshold() {
        assert_eq!(StabilizerConfig::new(0, 0), Err(StabilizerError::EmptyWindow));
        assert!(StabilizerConfig::new(5, 6).is_err());
        assert!(StabilizerConfig::new(5, 0).is_err());
        assert!(StabilizerConfig::new(5, 5).is_ok());
    }

    #[test]
    fn test_warm_up_is_processing() {
        let mut s = Stabilizer::new(StabilizerConfig::default()).unwrap();
        let decisions = feed(&mut s, 0, &[alice(), alice(), alice(), alice()]);
        assert!(decisions.iter().all(|d| *d == Decision::Processing));
    }

    #[test]
    fn test_confirms_with_one_flicker() {
        let mut s = Stabilizer::new(StabilizerConfig::default()).unwrap();
        let decisions = feed(
            &mut s,
            0,
            &[alice(), alice(), Label::Unknown, alice(), alice()],
        );
        assert_eq!(decisions[4], Decision::Confirmed(alice()));

        // Window slides to [Alice, Unknown, Alice, Alice, Alice]
        assert_eq!(s.observe(0, alice()), Decision::Confirmed(alice()));
    }

    #[test]
    fn test_below_threshold_stays_processing() {
        let mut s = Stabilizer::new(StabilizerConfig::default()).unwrap();
        let decisions = feed(
            &mut s,
            0,
            &[alice(), Label::Unknown, alice(), Label::Unknown, alice()],
        );
        assert_eq!(decisions[4], Decision::Processing);
    }

    #[test]
    fn test_exactly_threshold_confirms() {
        let config = StabilizerConfig::new(7, 4).unwrap();
        let mut s = Stabilizer::new(config).unwrap();
        let decisions = feed(
            &mut s,
            1,
            &[bob(), alice(), Label::Unknown, alice(), bob(), alice(), alice()],
        );
        assert_eq!(decisions[6], Decision::Confirmed(alice()));
    }

    #[test]
    fn test_threshold_minus_one_processing() {
        let config = StabilizerConfig::new(7, 4).unwrap();
        let mut s = Stabilizer::new(config).unwrap();
        let decisions = feed(
            &mut s,
            1,
            &[bob(), alice(), Label::Unknown, alice(), bob(), Label::Unknown, alice()],
        );
        assert_eq!(decisions[6], Decision::Processing);
    }

    #[test]
    fn test_unknown_can_be_confirmed() {
        let mut s = Stabilizer::new(StabilizerConfig::default()).unwrap();
        let decisions = feed(&mut s, 0, &vec![Label::Unknown; 5]);
        assert_eq!(decisions[4], Decision::Confirmed(Label::Unknown));
        assert_eq!(decisions[4].confirmed_identity(), None);
    }

    #[test]
    fn test_majority_tie_prefers_earliest_first_occurrence() {
        let mut s = Stabilizer::new(StabilizerConfig::new(4, 2).unwrap()).unwrap();
        feed(&mut s, 0, &[bob(), alice(), alice(), bob()]);
        let history = s.history(0).unwrap();
        let (label, count) = history.majority().unwrap();
        assert_eq!(label, &bob());
        assert_eq!(count, 2);
        assert_eq!(s.decision(0), Decision::Confirmed(bob()));
    }

    #[test]
    fn test_tracks_are_independent() {
        let mut s = Stabilizer::new(StabilizerConfig::default()).unwrap();
        for _ in 0..5 {
            let decisions = s.observe_frame(&[(0, alice()), (1, bob())]);
            assert_eq!(decisions.len(), 2);
        }
        assert_eq!(s.decision(0), Decision::Confirmed(alice()));
        assert_eq!(s.decision(1), Decision::Confirmed(bob()));
        assert_eq!(s.active_tracks(), vec![0, 1]);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut s = Stabilizer::new(StabilizerConfig::default()).unwrap();
        feed(&mut s, 0, &vec![alice(); 12]);
        assert_eq!(s.history(0).unwrap().len(), 5);
    }

    #[test]
    fn test_forget_resets_track() {
        let mut s = Stabilizer::new(StabilizerConfig::default()).unwrap();
        feed(&mut s, 0, &vec![alice(); 5]);
        s.forget(0);
        assert!(s.history(0).is_none());
        assert_eq!(s.observe(0, alice()), Decision::Processing);
    }

    #[test]
    fn test_decision_for_unseen_track() {
        let s = Stabilizer::new(StabilizerConfig::default()).unwrap();
        assert_eq!(s.decision(42), Decision::Processing);
    }
}
