//! Auto-commit policy.

use crate::core::types::WorktreeState;

/// Inputs to the auto-commit decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoCommitRequest<'a> {
    pub requested: bool,
    pub dry_run: bool,
    pub allow_dirty: bool,
    pub worktree: &'a WorktreeState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoCommitDecision {
    pub auto_commit: bool,
    pub warning: Option<String>,
}

/// Decide whether the loop may commit working-tree changes after a step.
///
/// Rules, first match wins:
/// 1. not requested, or a dry run: echo the request, no warning
/// 2. worktree state unavailable: disabled, warning names the error
/// 3. dirty tree without `allow_dirty`: disabled, warning asks for the override
/// 4. otherwise enabled
///
/// A disabled commit is never fatal; the loop keeps running.
pub fn decide(request: &AutoCommitRequest<'_>) -> AutoCommitDecision {
    if !request.requested || request.dry_run {
        return AutoCommitDecision {
            auto_commit: request.requested,
            warning: None,
        };
    }
    match request.worktree {
        WorktreeState::Unavailable { error } => AutoCommitDecision {
            auto_commit: false,
            warning: Some(format!(
                "auto-commit disabled: git working tree status unavailable ({error})"
            )),
        },
        WorktreeState::Available { dirty: true } if !request.allow_dirty => AutoCommitDecision {
            auto_commit: false,
            warning: Some(
                "auto-commit disabled: working tree was dirty before the run; pass --allow-dirty to commit anyway"
                    .to_string(),
            ),
        },
        WorktreeState::Available { .. } => AutoCommitDecision {
            auto_commit: true,
            warning: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(worktree: &WorktreeState, allow_dirty: bool) -> AutoCommitRequest<'_> {
        AutoCommitRequest {
            requested: true,
            dry_run: false,
            allow_dirty,
            worktree,
        }
    }

    #[test]
    fn not_requested_or_dry_run_echoes_request() {
        let dirty = WorktreeState::Available { dirty: true };
        let off = decide(&AutoCommitRequest {
            requested: false,
            ..request(&dirty, false)
        });
        assert_eq!(
            off,
            AutoCommitDecision {
                auto_commit: false,
                warning: None
            }
        );

        let dry = decide(&AutoCommitRequest {
            dry_run: true,
            ..request(&dirty, false)
        });
        assert_eq!(
            dry,
            AutoCommitDecision {
                auto_commit: true,
                warning: None
            }
        );
    }

    #[test]
    fn unavailable_worktree_disables_with_error() {
        let broken = WorktreeState::Unavailable {
            error: "not a git repository".to_string(),
        };
        let decision = decide(&request(&broken, true));
        assert!(!decision.auto_commit);
        assert!(
            decision
                .warning
                .expect("warning")
                .contains("not a git repository")
        );
    }

    #[test]
    fn dirty_tree_requires_allow_dirty() {
        let dirty = WorktreeState::Available { dirty: true };
        let blocked = decide(&request(&dirty, false));
        assert!(!blocked.auto_commit);
        assert!(blocked.warning.expect("warning").contains("dirty"));

        let allowed = decide(&request(&dirty, true));
        assert!(allowed.auto_commit);
        assert_eq!(allowed.warning, None);
    }

    #[test]
    fn clean_tree_enables() {
        let clean = WorktreeState::Available { dirty: false };
        assert!(decide(&request(&clean, false)).auto_commit);
    }
}
