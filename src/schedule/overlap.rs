use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Half-open overlap: `[a_start, a_end)` and `[b_start, b_end)` share at least
/// one instant. Empty or inverted intervals overlap nothing.
pub fn overlaps<T: PartialOrd>(a_start: T, a_end: T, b_start: T, b_end: T) -> bool {
    a_start < a_end && b_start < b_end && a_start < b_end && a_end > b_start
}

/// An already-booked `[start, end)` range, read from the store for one
/// provider and date. Never mutated during a computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookedInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BookedInterval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }
}

pub fn overlaps_any(start: DateTime<Utc>, end: DateTime<Utc>, booked: &[BookedInterval]) -> bool {
    booked.iter().any(|b| overlaps(start, end, b.start, b.end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_overlap() {
        assert!(overlaps(100, 200, 150, 250));
        assert!(overlaps(150, 250, 100, 200));
    }

    #[test]
    fn containment_overlaps() {
        assert!(overlaps(100, 400, 150, 300));
        assert!(overlaps(150, 300, 100, 400));
        assert!(overlaps(100, 200, 100, 200));
    }

    #[test]
    fn adjacent_does_not_overlap() {
        assert!(!overlaps(100, 200, 200, 300));
        assert!(!overlaps(200, 300, 100, 200));
    }

    #[test]
    fn disjoint_does_not_overlap() {
        assert!(!overlaps(100, 200, 300, 400));
    }

    #[test]
    fn zero_length_never_overlaps() {
        assert!(!overlaps(150, 150, 100, 200));
        assert!(!overlaps(100, 200, 150, 150));
        assert!(!overlaps(150, 150, 150, 150));
    }

    #[test]
    fn inverted_never_overlaps() {
        assert!(!overlaps(200, 100, 0, 1000));
    }

    #[test]
    fn any_against_booked() {
        let t = |m: i64| DateTime::<Utc>::from_timestamp(m * 60, 0).unwrap();
        let booked = [BookedInterval::new(t(30), t(60)), BookedInterval::new(t(120), t(150))];
        assert!(overlaps_any(t(45), t(75), &booked));
        assert!(!overlaps_any(t(60), t(120), &booked));
        assert!(!overlaps_any(t(0), t(30), &[]));
    }
}
