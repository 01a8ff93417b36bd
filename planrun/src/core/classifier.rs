//! Deterministic classification of step attempt failures.

use crate::core::types::{AttemptOutcome, FailureKind, PostCheckResult, StepFailure};

/// The provider-side facts the classifier needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderVerdict<'a> {
    pub ok: bool,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub error: Option<&'a str>,
}

/// Classify a provider result plus the post-checks that ran after it.
///
/// Timeouts win over exit codes because a killed process reports a signal
/// status. Post-checks only count when the provider call itself succeeded;
/// the first failing check is reported.
pub fn classify(provider: &ProviderVerdict<'_>, post_checks: &[PostCheckResult]) -> AttemptOutcome {
    if provider.timed_out {
        return AttemptOutcome::Failed(StepFailure {
            kind: FailureKind::Timeout,
            detail: provider
                .error
                .map(str::to_string)
                .unwrap_or_else(|| "provider timed out".to_string()),
        });
    }
    if !provider.ok {
        let mut detail = match provider.exit_code {
            Some(code) => format!("provider exited with status {code}"),
            None => "provider terminated without an exit status".to_string(),
        };
        if let Some(error) = provider.error {
            detail.push_str(": ");
            detail.push_str(error);
        }
        return AttemptOutcome::Failed(StepFailure {
            kind: FailureKind::ProcessFailure,
            detail,
        });
    }
    if let Some(check) = post_checks.iter().find(|check| !check.passed()) {
        let detail = if check.timed_out {
            format!("post-check `{}` timed out", check.command)
        } else {
            match check.exit_code {
                Some(code) => format!("post-check `{}` exited with status {code}", check.command),
                None => format!("post-check `{}` could not run", check.command),
            }
        };
        return AttemptOutcome::Failed(StepFailure {
            kind: FailureKind::PostCheckFailure,
            detail,
        });
    }
    AttemptOutcome::Succeeded
}
