use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

pub const HISTORY_CAPACITY: usize = 100;
pub const DISPLACEMENT_WINDOW: Duration = Duration::from_secs(2);

/// Ring of timestamped centroids.
///
/// Displacement is measured across a trailing time window rather than between
/// consecutive frames, so a jittery frame rate does not change the verdict.
#[derive(Debug, Clone)]
pub struct PositionHistory {
    samples: VecDeque<(Instant, (f32, f32))>,
    capacity: usize,
}

impl Default for PositionHistory {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl PositionHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, at: Instant, centroid: (f32, f32)) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((at, centroid));
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Euclidean distance between the oldest and newest centroid within
    /// `window` of the newest sample. `None` with fewer than two samples in
    /// the window.
    pub fn displacement(&self, window: Duration) -> Option<f32> {
        let &(newest_at, newest) = self.samples.back()?;
        let mut in_window = self
            .samples
            .iter()
            .filter(|(at, _)| newest_at.saturating_duration_since(*at) <= window);
        let &(oldest_at, oldest) = in_window.next()?;
        if oldest_at == newest_at && in_window.next().is_none() {
            return None;
        }
        let dx = newest.0 - oldest.0;
        let dy = newest.1 - oldest.1;
        Some((dx * dx + dy * dy).sqrt())
    }
}
