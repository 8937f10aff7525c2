//! Action vocabulary and timing masks.
//!
//! Actions fire relative to the coupling exchange inside `advance()`. The
//! built-in names below are produced and consumed by the runtime itself;
//! user-defined tags pass through [`crate::session::Session::is_action_required`]
//! opaquely.

/// The solver must store a rollback copy of its state.
pub const WRITE_ITERATION_CHECKPOINT: &str = "write-iteration-checkpoint";
/// The solver must restore the rollback copy stored earlier.
pub const READ_ITERATION_CHECKPOINT: &str = "read-iteration-checkpoint";
/// The solver should emit its own visualization output.
pub const PLOT_OUTPUT: &str = "plot-output";

/// Timing of a configured data action, expressed as a bitmask so one
/// `matches` test replaces set construction at every dispatch site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionTiming {
    /// Every `advance`, before the coupling scheme runs.
    AlwaysPrior,
    /// Every `advance`, after the coupling scheme ran.
    AlwaysPost,
    /// Only when data will be exchanged, before the scheme runs.
    OnExchangePrior,
    /// Only when data has been exchanged, after the scheme ran.
    OnExchangePost,
    /// Only when the time window completed, after the scheme ran.
    OnWindowCompletePost,
}

impl ActionTiming {
    #[inline]
    pub const fn bit(self) -> u8 {
        1 << self as u8
    }

    /// Whether this timing is selected by `mask`.
    #[inline]
    pub const fn matches(self, mask: u8) -> bool {
        mask & self.bit() != 0
    }
}

/// Build a dispatch mask from timing flags observed during one `advance`.
pub fn timing_mask(always_prior: bool, will_exchange: bool) -> u8 {
    let mut mask = 0;
    if always_prior {
        mask |= ActionTiming::AlwaysPrior.bit();
        if will_exchange {
            mask |= ActionTiming::OnExchangePrior.bit();
        }
    }
    mask
}

/// Post-advance dispatch mask.
pub fn post_timing_mask(exchanged: bool, window_complete: bool) -> u8 {
    let mut mask = ActionTiming::AlwaysPost.bit();
    if exchanged {
        mask |= ActionTiming::OnExchangePost.bit();
    }
    if window_complete {
        mask |= ActionTiming::OnWindowCompletePost.bit();
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_are_disjoint() {
        let all = [
            ActionTiming::AlwaysPrior,
            ActionTiming::AlwaysPost,
            ActionTiming::OnExchangePrior,
            ActionTiming::OnExchangePost,
            ActionTiming::OnWindowCompletePost,
        ];
        let mut seen = 0u8;
        for t in all {
            assert_eq!(seen & t.bit(), 0);
            seen |= t.bit();
        }
    }

    #[test]
    fn masks_select_expected_timings() {
        let prior = timing_mask(true, true);
        assert!(ActionTiming::AlwaysPrior.matches(prior));
        assert!(ActionTiming::OnExchangePrior.matches(prior));
        assert!(!ActionTiming::AlwaysPost.matches(prior));

        let post = post_timing_mask(true, false);
        assert!(ActionTiming::AlwaysPost.matches(post));
        assert!(ActionTiming::OnExchangePost.matches(post));
        assert!(!ActionTiming::OnWindowCompletePost.matches(post));
    }
}
