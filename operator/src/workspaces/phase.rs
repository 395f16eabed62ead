use arl_types::WorkspacePhase;

/// The guarded transition graph on `Workspace.status.phase`. `Failed` is
/// absorbing; everything outside these edges is rejected without mutating
/// the stored phase.
///
/// ```text
/// ∅ -> Pending -> Bound -> Ready
///         \         \        \
///          +-> Failed <-------+
/// ```
pub fn transition_allowed(from: Option<WorkspacePhase>, to: WorkspacePhase) -> bool {
    use WorkspacePhase::*;
    matches!(
        (from, to),
        (None, Pending)
            | (Some(Pending), Bound)
            | (Some(Pending), Failed)
            | (Some(Bound), Ready)
            | (Some(Bound), Failed)
            | (Some(Ready), Failed)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use arl_types::WorkspacePhase::*;

    const ALL: [WorkspacePhase; 4] = [Pending, Bound, Ready, Failed];

    #[test]
    fn only_pending_enters_from_empty() {
        assert!(transition_allowed(None, Pending));
        for to in [Bound, Ready, Failed] {
            assert!(!transition_allowed(None, to), "∅ -> {to} must be rejected");
        }
    }

    #[test]
    fn happy_path_is_legal() {
        assert!(transition_allowed(Some(Pending), Bound));
        assert!(transition_allowed(Some(Bound), Ready));
    }

    #[test]
    fn every_live_phase_may_fail() {
        for from in [Pending, Bound, Ready] {
            assert!(transition_allowed(Some(from), Failed), "{from} -> Failed");
        }
    }

    #[test]
    fn failed_is_absorbing() {
        for to in ALL {
            assert!(
                !transition_allowed(Some(Failed), to),
                "Failed -> {to} must be rejected"
            );
        }
    }

    #[test]
    fn no_backward_or_skipping_edges() {
        assert!(!transition_allowed(Some(Pending), Ready), "skip over Bound");
        assert!(!transition_allowed(Some(Bound), Bound), "self loop");
        assert!(!transition_allowed(Some(Ready), Bound), "backward");
        assert!(!transition_allowed(Some(Ready), Pending), "backward");
        assert!(!transition_allowed(Some(Bound), Pending), "backward");
    }
}
