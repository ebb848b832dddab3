//! Stall detection for downloads: a coarse, sample-based substitute for per-chunk timers.

use std::collections::HashMap;

use crate::chunk::MissingRange;

/// What a monitor pass saw for one download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    pub first_missing: u32,
    pub missing_chunks: u64,
}

impl ProgressSample {
    /// `None` when nothing is missing.
    pub fn from_ranges(ranges: &[MissingRange]) -> Option<Self> {
        let first = ranges.first()?;
        Some(Self {
            first_missing: first.start,
            missing_chunks: ranges.iter().map(|r| u64::from(r.count)).sum(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Track {
    sample: ProgressSample,
    /// Identical samples seen since the last re-request (or since the sample last changed).
    repeats: u32,
    fired: bool,
}

/// Per-file memory of the previous sample.
///
/// A re-request fires once when a sample repeats unchanged. While the stall persists it fires
/// again only after `rearm_after` more identical samples. Any change in the sample (visible
/// progress) starts a fresh episode.
#[derive(Debug, Clone)]
pub struct StallDetector {
    rearm_after: u32,
    tracks: HashMap<u32, Track>,
}

impl StallDetector {
    pub fn new(rearm_after: u32) -> Self {
        Self {
            rearm_after: rearm_after.max(1),
            tracks: HashMap::new(),
        }
    }

    /// Record a sample for `file_id`. Returns true if a re-request should be issued now.
    pub fn observe(&mut self, file_id: u32, sample: ProgressSample) -> bool {
        let Some(track) = self.tracks.get_mut(&file_id) else {
            self.tracks.insert(
                file_id,
                Track {
                    sample,
                    repeats: 0,
                    fired: false,
                },
            );
            return false;
        };
        if track.sample != sample {
            *track = Track {
                sample,
                repeats: 0,
                fired: false,
            };
            return false;
        }
        track.repeats += 1;
        if !track.fired || track.repeats > self.rearm_after {
            track.fired = true;
            track.repeats = 0;
            return true;
        }
        false
    }

    /// Drop the memory for a finished or abandoned download.
    pub fn forget(&mut self, file_id: u32) {
        self.tracks.remove(&file_id);
    }

    pub fn tracked(&self) -> usize {
        self.tracks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(first: u32, missing: u64) -> ProgressSample {
        ProgressSample {
            first_missing: first,
            missing_chunks: missing,
        }
    }

    fn fires(detector: &mut StallDetector, samples: &[ProgressSample]) -> Vec<bool> {
        samples.iter().map(|s| detector.observe(1, *s)).collect()
    }

    #[test]
    fn first_sample_never_fires() {
        let mut d = StallDetector::new(5);
        assert!(!d.observe(1, sample(2, 1)));
    }

    #[test]
    fn stall_fires_once_per_episode() {
        let mut d = StallDetector::new(5);
        let s = sample(2, 1);
        assert_eq!(
            fires(&mut d, &[s, s, s, s, s]),
            vec![false, true, false, false, false]
        );
    }

    #[test]
    fn progress_resets_the_episode() {
        let mut d = StallDetector::new(5);
        let got = fires(
            &mut d,
            &[
                sample(2, 9),
                sample(2, 9),
                sample(2, 7), // progress behind the first gap
                sample(2, 7),
                sample(4, 3),
            ],
        );
        assert_eq!(got, vec![false, true, false, true, false]);
    }

    #[test]
    fn progress_beyond_first_gap_is_not_a_stall() {
        let mut d = StallDetector::new(5);
        let got = fires(&mut d, &[sample(1, 10), sample(1, 8), sample(1, 6), sample(1, 4)]);
        assert!(got.iter().all(|f| !f));
    }

    #[test]
    fn persistent_stall_rearms() {
        let mut d = StallDetector::new(2);
        let s = sample(3, 2);
        assert_eq!(
            fires(&mut d, &[s, s, s, s, s, s, s]),
            vec![false, true, false, false, true, false, false]
        );
    }

    #[test]
    fn files_are_tracked_independently() {
        let mut d = StallDetector::new(5);
        assert!(!d.observe(1, sample(1, 1)));
        assert!(!d.observe(2, sample(1, 1)));
        assert!(d.observe(1, sample(1, 1)));
        d.forget(2);
        assert_eq!(d.tracked(), 1);
        assert!(!d.observe(2, sample(1, 1)));
    }

    #[test]
    fn sample_from_ranges() {
        assert_eq!(ProgressSample::from_ranges(&[]), None);
        assert_eq!(
            ProgressSample::from_ranges(&[MissingRange::new(2, 1), MissingRange::new(5, 3)]),
            Some(sample(2, 4))
        );
    }
}
