//! Help-text capability matching.
//!
//! Providers declare which help invocations to run and which tokens prove a
//! capability. Matching is pure: the caller gathers the help texts (see
//! `io::help`) and this module decides what is present, degraded, or missing.

use serde::Serialize;

/// Optional features a provider CLI may or may not expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Resume,
    OutputSchemaPath,
    JsonSchema,
}

impl Capability {
    fn degraded_note(self) -> &'static str {
        match self {
            Capability::Resume => "session resumption disabled; retries start fresh sessions",
            Capability::OutputSchemaPath | Capability::JsonSchema => {
                "schema-constrained output disabled; falling back to best-effort text parsing"
            }
        }
    }
}

/// One help invocation, e.g. `codex exec --help`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelpProbe {
    pub args: &'static [&'static str],
}

/// A token set that must be present in one probe's help text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirement {
    pub name: &'static str,
    /// Index into the provider's probe list.
    pub probe: usize,
    pub tokens: &'static [&'static str],
    /// `None` marks a requirement the provider cannot run without.
    pub capability: Option<Capability>,
}

/// Capabilities an adapter implements, independent of the installed CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StaticSupport {
    pub resume: bool,
    pub output_schema_path: bool,
    pub json_schema: bool,
}

impl StaticSupport {
    fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Resume => self.resume,
            Capability::OutputSchemaPath => self.output_schema_path,
            Capability::JsonSchema => self.json_schema,
        }
    }
}

/// What the installed CLI was found to support.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ProbeReport {
    pub supports_resume: bool,
    pub supports_output_schema_path: bool,
    pub supports_json_schema: bool,
    pub warnings: Vec<String>,
    pub fatal_missing: Vec<String>,
}

/// Substrings (lowercase) that mean the CLI rejected the help invocation.
pub const UNKNOWN_FLAG_MARKERS: [&str; 7] = [
    "unknown option",
    "unrecognized option",
    "unknown command",
    "unexpected argument",
    "invalid option",
    "unknown flag",
    "unknown argument",
];

/// True if `text` looks like an error page rather than real help output.
pub fn indicates_unknown_flag(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    UNKNOWN_FLAG_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}

/// True if every token is present and the text is not an error page.
pub fn requirement_met(text: &str, tokens: &[&str]) -> bool {
    !indicates_unknown_flag(text) && tokens.iter().all(|token| text.contains(token))
}

/// Evaluate `requirements` against `help_texts` (indexed like the probe list).
///
/// A missing help text counts as empty, so nothing in it matches.
pub fn evaluate(
    support: StaticSupport,
    requirements: &[Requirement],
    help_texts: &[String],
) -> ProbeReport {
    let mut report = ProbeReport::default();
    let mut detected = StaticSupport::default();

    for requirement in requirements {
        let text = help_texts
            .get(requirement.probe)
            .map(String::as_str)
            .unwrap_or("");
        let met = requirement_met(text, requirement.tokens);
        match requirement.capability {
            None => {
                if !met {
                    report.fatal_missing.push(requirement.name.to_string());
                }
            }
            Some(capability) => {
                if !support.has(capability) {
                    continue;
                }
                if met {
                    set(&mut detected, capability);
                } else {
                    report.warnings.push(format!(
                        "{} not detected: {}",
                        requirement.name,
                        capability.degraded_note()
                    ));
                }
            }
        }
    }

    report.supports_resume = detected.resume;
    report.supports_output_schema_path = detected.output_schema_path;
    report.supports_json_schema = detected.json_schema;
    report
}

fn set(support: &mut StaticSupport, capability: Capability) {
    match capability {
        Capability::Resume => support.resume = true,
        Capability::OutputSchemaPath => support.output_schema_path = true,
        Capability::JsonSchema => support.json_schema = true,
    }
}
