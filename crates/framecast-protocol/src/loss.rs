/// Session-wide packet loss counter. Observational only: nothing in the
/// receive path consults it to make decisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LossTracker {
    received: u64,
    lost: u64,
}

impl LossTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&mut self) {
        self.received += 1;
    }

    pub fn record_lost(&mut self) {
        self.lost += 1;
    }

    pub fn record_lost_n(&mut self, n: u64) {
        self.lost += n;
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }

    /// `lost / (lost + received)`, or 0.0 before any packet was accounted for.
    pub fn loss_ratio(&self) -> f64 {
        let total = self.lost + self.received;
        if total == 0 {
            0.0
        } else {
            self.lost as f64 / total as f64
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tracker_has_zero_ratio() {
        assert_eq!(LossTracker::new().loss_ratio(), 0.0);
    }

    #[test]
    fn ratio_counts_both_sides() {
        let mut tracker = LossTracker::new();
        for _ in 0..3 {
            tracker.record_received();
        }
        tracker.record_lost();
        assert_eq!(tracker.received(), 3);
        assert_eq!(tracker.lost(), 1);
        assert!((tracker.loss_ratio() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn all_lost() {
        let mut tracker = LossTracker::new();
        tracker.record_lost_n(4);
        assert_eq!(tracker.loss_ratio(), 1.0);
    }

    #[test]
    fn reset_clears_counts() {
        let mut tracker = LossTracker::new();
        tracker.record_received();
        tracker.record_lost();
        tracker.reset();
        assert_eq!(tracker, LossTracker::new());
    }
}
