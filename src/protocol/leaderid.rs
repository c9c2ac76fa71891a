//! Leader incarnation identifier: a totally ordered `(term, id)` pair.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies one leader incarnation. Ordering is lexicographic on
/// `(term, id)`; the zero value means "no leader".
#[derive(
    Debug,
    Clone,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct LeaderId {
    pub term: i64,
    pub id: i64,
}

impl LeaderId {
    /// Creates a leader id from term and member id.
    pub fn new(term: i64, id: i64) -> Self {
        LeaderId { term, id }
    }

    /// Compact rendering for log lines, e.g. `001#002`.
    pub fn short_str(&self) -> String {
        format!("{:0>3}#{:0>3}", self.term, self.id)
    }
}

impl fmt::Display for LeaderId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.short_str())
    }
}

#[cfg(test)]
mod leaderid_tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn total_order() {
        // term dominates, then id
        assert_eq!(
            LeaderId::new(1, 2).cmp(&LeaderId::new(2, 1)),
            Ordering::Less
        );
        assert_eq!(
            LeaderId::new(3, 1).cmp(&LeaderId::new(2, 9)),
            Ordering::Greater
        );
        assert_eq!(
            LeaderId::new(2, 1).cmp(&LeaderId::new(2, 2)),
            Ordering::Less
        );
        assert_eq!(
            LeaderId::new(2, 2).cmp(&LeaderId::new(2, 2)),
            Ordering::Equal
        );
    }

    #[test]
    fn zero_value() {
        assert_eq!(LeaderId::default(), LeaderId::new(0, 0));
        assert!(LeaderId::default() < LeaderId::new(0, 1));
    }

    #[test]
    fn clone_is_independent() {
        let a = LeaderId::new(1, 2);
        let mut b = a.clone();
        b.term = 9;
        assert_eq!(a, LeaderId::new(1, 2));
    }

    #[test]
    fn short_str_form() {
        assert_eq!(LeaderId::new(1, 2).short_str(), "001#002");
        assert_eq!(LeaderId::new(0, 0).short_str(), "000#000");
        assert_eq!(format!("{}", LeaderId::new(12, 345)), "012#345");
    }
}
