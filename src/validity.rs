//! The three-state validity lattice a graph node's cached result carries.

use serde::{Deserialize, Serialize};

/// `STRONGLY_INVALID` dominates `WEAKLY_INVALID` dominates `VALID`: once a
/// node is demoted, nothing but a fresh [`crate::graph::Graph::put`] or a
/// successful [`crate::graph::Graph::validate_weak`] can promote it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Validity {
    Valid,
    WeaklyInvalid,
    StronglyInvalid,
}

impl Validity {
    /// Demotes `self` to at least `floor`, never promoting.
    pub(crate) fn demoted_to_at_least(self, floor: Validity) -> Validity {
        match (self, floor) {
            (Validity::StronglyInvalid, _) => Validity::StronglyInvalid,
            (_, Validity::StronglyInvalid) => Validity::StronglyInvalid,
            (Validity::WeaklyInvalid, _) => Validity::WeaklyInvalid,
            (_, Validity::WeaklyInvalid) => Validity::WeaklyInvalid,
            (Validity::Valid, Validity::Valid) => Validity::Valid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Validity::*;

    #[test]
    fn strong_dominates_everything() {
        assert_eq!(Valid.demoted_to_at_least(StronglyInvalid), StronglyInvalid);
        assert_eq!(
            WeaklyInvalid.demoted_to_at_least(StronglyInvalid),
            StronglyInvalid
        );
        assert_eq!(
            StronglyInvalid.demoted_to_at_least(WeaklyInvalid),
            StronglyInvalid
        );
    }

    #[test]
    fn weak_does_not_promote_past_current() {
        assert_eq!(Valid.demoted_to_at_least(WeaklyInvalid), WeaklyInvalid);
        assert_eq!(WeaklyInvalid.demoted_to_at_least(Valid), WeaklyInvalid);
    }

    #[test]
    fn valid_floor_is_a_no_op() {
        assert_eq!(Valid.demoted_to_at_least(Valid), Valid);
    }
}
