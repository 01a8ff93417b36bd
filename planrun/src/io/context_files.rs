//! Context documents that must exist before a run starts.

use std::path::{Path, PathBuf};

use crate::io::config::ContextSection;
use crate::plan::Plan;

/// Lookup seam for context documents; tests substitute an in-memory set.
pub trait ContextFiles {
    fn exists(&self, path: &Path) -> bool;
}

/// Resolves context paths against the working directory.
#[derive(Debug, Clone)]
pub struct FsContextFiles {
    root: PathBuf,
}

impl FsContextFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ContextFiles for FsContextFiles {
    fn exists(&self, path: &Path) -> bool {
        self.root.join(path).is_file()
    }
}

/// Documents the plan needs: every `required` entry, plus the files of each
/// conditional rule whose prefix matches some step's `files` entry.
///
/// Order is config order; duplicates are dropped.
pub fn required_documents(section: &ContextSection, plan: &Plan) -> Vec<PathBuf> {
    let mut docs: Vec<PathBuf> = Vec::new();
    let mut push = |path: &PathBuf| {
        if !docs.contains(path) {
            docs.push(path.clone());
        }
    };
    section.required.iter().for_each(&mut push);
    for rule in &section.conditional {
        let triggered = plan
            .steps
            .iter()
            .flat_map(|step| step.files.iter())
            .any(|file| file.starts_with(&rule.path_prefix));
        if triggered {
            rule.files.iter().for_each(&mut push);
        }
    }
    docs
}

/// Required documents that do not exist.
pub fn missing_documents<C: ContextFiles>(
    files: &C,
    section: &ContextSection,
    plan: &Plan,
) -> Vec<PathBuf> {
    required_documents(section, plan)
        .into_iter()
        .filter(|path| !files.exists(path))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::ConditionalContext;
    use crate::plan::Step;
    use crate::test_support::plan_with_steps;

    fn section() -> ContextSection {
        ContextSection {
            required: vec![PathBuf::from("AGENTS.md")],
            conditional: vec![
                ConditionalContext {
                    path_prefix: "docs/".to_string(),
                    files: vec![PathBuf::from("docs/STYLE.md"), PathBuf::from("AGENTS.md")],
                },
                ConditionalContext {
                    path_prefix: "infra/".to_string(),
                    files: vec![PathBuf::from("infra/RUNBOOK.md")],
                },
            ],
            allow_missing: false,
        }
    }

    fn plan_touching(files: &[&str]) -> Plan {
        let mut step = Step::new("a", "A");
        step.files = files.iter().map(|f| f.to_string()).collect();
        plan_with_steps(vec![step])
    }

    #[test]
    fn conditional_rules_follow_step_files() {
        let docs = required_documents(&section(), &plan_touching(&["docs/guide.md", "src/lib.rs"]));
        assert_eq!(
            docs,
            vec![PathBuf::from("AGENTS.md"), PathBuf::from("docs/STYLE.md")]
        );

        let docs = required_documents(&section(), &plan_touching(&["src/lib.rs"]));
        assert_eq!(docs, vec![PathBuf::from("AGENTS.md")]);
    }

    #[test]
    fn filesystem_lookup_reports_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("AGENTS.md"), "rules").expect("write");
        let files = FsContextFiles::new(temp.path());

        let missing = missing_documents(&files, &section(), &plan_touching(&["infra/main.tf"]));
        assert_eq!(missing, vec![PathBuf::from("infra/RUNBOOK.md")]);
    }
}
