//! Soft admission control: run inline while the backlog is short.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchMode {
    Inline,
    Queued,
}

/// `Inline` iff `backlog_depth < threshold`.
///
/// The depth is a point-in-time snapshot; it may be stale by the time the
/// caller enqueues, which is accepted.
pub fn decide(backlog_depth: u64, threshold: u64) -> DispatchMode {
    if backlog_depth < threshold {
        DispatchMode::Inline
    } else {
        DispatchMode::Queued
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_backlog_runs_inline() {
        assert_eq!(decide(2, 5), DispatchMode::Inline);
    }

    #[test]
    fn long_backlog_is_queued() {
        assert_eq!(decide(6, 5), DispatchMode::Queued);
    }

    #[test]
    fn threshold_itself_is_queued() {
        assert_eq!(decide(5, 5), DispatchMode::Queued);
    }

    #[test]
    fn zero_threshold_always_queues() {
        assert_eq!(decide(0, 0), DispatchMode::Queued);
    }

    #[test]
    fn matches_strict_less_than_for_all_small_pairs() {
        for depth in 0..20u64 {
            for threshold in 0..20u64 {
                let expected = if depth < threshold {
                    DispatchMode::Inline
                } else {
                    DispatchMode::Queued
                };
                assert_eq!(decide(depth, threshold), expected, "depth={depth} threshold={threshold}");
            }
        }
    }
}
