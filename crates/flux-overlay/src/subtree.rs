//! Subtree status: the enum each broker reports about itself and about
//! each direct child, and the aggregation rule that derives a broker's own
//! status from its children's.

use serde::{Deserialize, Serialize};

/// Wire-encoded as its integer value (§3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum SubtreeStatus {
    Unknown = 0,
    Full = 1,
    Partial = 2,
    Degraded = 3,
    Lost = 4,
    Offline = 5,
}

impl SubtreeStatus {
    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Unknown),
            1 => Some(Self::Full),
            2 => Some(Self::Partial),
            3 => Some(Self::Degraded),
            4 => Some(Self::Lost),
            5 => Some(Self::Offline),
            _ => None,
        }
    }

    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Full => "full",
            Self::Partial => "partial",
            Self::Degraded => "degraded",
            Self::Lost => "lost",
            Self::Offline => "offline",
        }
    }

    /// A child (or self) is online iff its status is one of full/partial/degraded.
    pub fn is_online(self) -> bool {
        matches!(self, Self::Full | Self::Partial | Self::Degraded)
    }
}

/// Derive this broker's own status from the statuses of its direct
/// children, per §3's precedence rule. A leaf (no children) is always
/// `Full`.
pub fn aggregate<'a>(children: impl Iterator<Item = &'a SubtreeStatus>) -> SubtreeStatus {
    let mut any_degraded_or_lost = false;
    let mut any_partial_or_offline = false;
    let mut saw_any = false;

    for status in children {
        saw_any = true;
        match status {
            SubtreeStatus::Degraded | SubtreeStatus::Lost => any_degraded_or_lost = true,
            SubtreeStatus::Partial | SubtreeStatus::Offline => any_partial_or_offline = true,
            SubtreeStatus::Full => {}
            SubtreeStatus::Unknown => {}
        }
    }

    if !saw_any {
        return SubtreeStatus::Full;
    }
    if any_degraded_or_lost {
        SubtreeStatus::Degraded
    } else if any_partial_or_offline {
        SubtreeStatus::Partial
    } else {
        SubtreeStatus::Full
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_is_always_full() {
        assert_eq!(aggregate(std::iter::empty()), SubtreeStatus::Full);
    }

    #[test]
    fn all_full_children_yield_full() {
        let kids = [SubtreeStatus::Full, SubtreeStatus::Full];
        assert_eq!(aggregate(kids.iter()), SubtreeStatus::Full);
    }

    #[test]
    fn partial_or_offline_without_degraded_yields_partial() {
        let kids = [SubtreeStatus::Full, SubtreeStatus::Offline];
        assert_eq!(aggregate(kids.iter()), SubtreeStatus::Partial);

        let kids = [SubtreeStatus::Partial, SubtreeStatus::Full];
        assert_eq!(aggregate(kids.iter()), SubtreeStatus::Partial);
    }

    #[test]
    fn degraded_or_lost_dominates_partial_and_offline() {
        let kids = [SubtreeStatus::Offline, SubtreeStatus::Lost, SubtreeStatus::Full];
        assert_eq!(aggregate(kids.iter()), SubtreeStatus::Degraded);

        let kids = [SubtreeStatus::Degraded, SubtreeStatus::Full];
        assert_eq!(aggregate(kids.iter()), SubtreeStatus::Degraded);
    }

    #[test]
    fn online_set_matches_spec() {
        assert!(SubtreeStatus::Full.is_online());
        assert!(SubtreeStatus::Partial.is_online());
        assert!(SubtreeStatus::Degraded.is_online());
        assert!(!SubtreeStatus::Lost.is_online());
        assert!(!SubtreeStatus::Offline.is_online());
        assert!(!SubtreeStatus::Unknown.is_online());
    }

    #[test]
    fn wire_int_roundtrips() {
        for s in [
            SubtreeStatus::Unknown,
            SubtreeStatus::Full,
            SubtreeStatus::Partial,
            SubtreeStatus::Degraded,
            SubtreeStatus::Lost,
            SubtreeStatus::Offline,
        ] {
            assert_eq!(SubtreeStatus::from_i64(s.as_i64()), Some(s));
        }
        assert_eq!(SubtreeStatus::from_i64(99), None);
    }
}
