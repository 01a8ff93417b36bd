//! Git access for the auto-commit path.
//!
//! The run snapshots the working tree once before the first step and commits
//! after each successful step. Everything goes through the `git` binary in the
//! working directory; no repository state is cached.
//!
//! Files planrun writes itself (plan, run logs, `.planrun/`) are registered
//! as excluded paths: they never make the tree dirty and are never staged.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::types::WorktreeState;

/// Working tree operations the loop depends on.
pub trait Worktree {
    /// Snapshot whether the tree is dirty; failures become `Unavailable`.
    fn state(&self) -> WorktreeState;

    /// Stage everything and commit. Returns `false` when there was nothing to commit.
    fn commit_all(&self, message: &str) -> Result<bool>;
}

/// The `git` CLI bound to one working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    /// Workdir-relative paths left out of status and staging.
    excluded: Vec<String>,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            excluded: Vec::new(),
        }
    }

    /// Ignore `paths` (files or directories) in status and commits.
    ///
    /// Relative paths are taken from the working directory; absolute paths
    /// outside it are dropped since git would reject them as pathspecs.
    pub fn excluding<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        for path in paths {
            let path = path.as_ref();
            let relative = if path.is_absolute() {
                match path.strip_prefix(&self.workdir) {
                    Ok(relative) => relative,
                    Err(_) => {
                        debug!(path = %path.display(), "excluded path outside workdir");
                        continue;
                    }
                }
            } else {
                path
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            let relative = relative.trim_start_matches("./").trim_end_matches('/');
            if !relative.is_empty() && !self.excluded.iter().any(|known| known == relative) {
                self.excluded.push(relative.to_string());
            }
        }
        self
    }

    /// Paths reported by `git status`, untracked files included, minus excluded ones.
    pub fn changed_paths(&self) -> Result<Vec<String>> {
        let mut args = vec!["status", "--porcelain=v1", "-uall"];
        let pathspec = self.pathspec();
        args.extend(pathspec.iter().map(String::as_str));
        let stdout = self.stdout(&args)?;
        stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(changed_path)
            .collect()
    }

    /// The whole repository minus excluded paths.
    fn pathspec(&self) -> Vec<String> {
        let mut spec = vec!["--".to_string(), ":/".to_string()];
        spec.extend(self.excluded.iter().map(|path| format!(":(exclude){path}")));
        spec
    }

    /// `git diff --cached --quiet` exits 1 when something is staged.
    fn index_has_changes(&self) -> Result<bool> {
        let output = self.exec(&["diff", "--cached", "--quiet"])?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(failure(&["diff", "--cached", "--quiet"], &output)),
        }
    }

    fn stdout(&self, args: &[&str]) -> Result<String> {
        let output = self.exec(args)?;
        if !output.status.success() {
            return Err(failure(args, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn exec(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl Worktree for Git {
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    fn state(&self) -> WorktreeState {
        match self.changed_paths() {
            Ok(paths) => {
                debug!(changed = paths.len(), "worktree status");
                WorktreeState::Available {
                    dirty: !paths.is_empty(),
                }
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "worktree status unavailable");
                WorktreeState::Unavailable {
                    error: format!("{err:#}"),
                }
            }
        }
    }

    #[instrument(skip_all)]
    fn commit_all(&self, message: &str) -> Result<bool> {
        let mut args = vec!["add", "-A"];
        let pathspec = self.pathspec();
        args.extend(pathspec.iter().map(String::as_str));
        self.stdout(&args)?;
        if !self.index_has_changes()? {
            debug!("nothing staged");
            return Ok(false);
        }
        self.stdout(&["commit", "--quiet", "-m", message])?;
        Ok(true)
    }
}

fn failure(args: &[&str], output: &Output) -> anyhow::Error {
    anyhow!(
        "git {} failed ({}): {}",
        args.join(" "),
        output.status,
        String::from_utf8_lossy(&output.stderr).trim()
    )
}

/// Path of one porcelain v1 line; renames report the destination.
fn changed_path(line: &str) -> Result<String> {
    let path = line
        .get(3..)
        .ok_or_else(|| anyhow!("malformed git status line '{line}'"))?;
    let path = match path.rsplit_once(" -> ") {
        Some((_, to)) => to,
        None => path,
    };
    Ok(path.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn init_repo(root: &Path) {
        for args in [
            vec!["init", "-q"],
            vec!["config", "user.email", "planrun@example.com"],
            vec!["config", "user.name", "planrun"],
            vec!["config", "commit.gpgsign", "false"],
        ] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(root)
                .status()
                .expect("git");
            assert!(status.success(), "git {args:?}");
        }
    }

    #[test]
    fn porcelain_lines_yield_paths() {
        assert_eq!(changed_path("?? notes.md").expect("untracked"), "notes.md");
        assert_eq!(changed_path(" M src/lib.rs").expect("modified"), "src/lib.rs");
        assert_eq!(changed_path("R  old.txt -> new.txt").expect("rename"), "new.txt");
        assert!(changed_path("M").is_err());
    }

    #[test]
    fn state_outside_repository_is_unavailable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let state = Git::new(temp.path()).state();
        assert!(matches!(state, WorktreeState::Unavailable { .. }));
    }

    /// Dirty tree is detected, committed, and reported clean afterwards.
    #[test]
    fn commit_all_cleans_dirty_tree() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_repo(temp.path());
        let git = Git::new(temp.path());
        assert_eq!(git.state(), WorktreeState::Available { dirty: false });

        fs::write(temp.path().join("notes.md"), "hello\n").expect("write");
        assert_eq!(git.changed_paths().expect("status"), vec!["notes.md"]);
        assert_eq!(git.state(), WorktreeState::Available { dirty: true });

        assert!(git.commit_all("planrun: step one").expect("commit"));
        assert_eq!(git.state(), WorktreeState::Available { dirty: false });
        assert!(!git.commit_all("planrun: nothing").expect("noop"));
    }

    fn tracked_files(root: &Path) -> Vec<String> {
        let output = Command::new("git")
            .args(["ls-files"])
            .current_dir(root)
            .output()
            .expect("git ls-files");
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn excluded_paths_are_neither_dirty_nor_committed() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_repo(temp.path());
        let git = Git::new(temp.path())
            .excluding([temp.path().join("plan.json"), PathBuf::from(".planrun")]);

        fs::create_dir_all(temp.path().join(".planrun/run-logs")).expect("mkdir");
        fs::write(temp.path().join(".planrun/run-logs/run-1.jsonl"), "{}\n").expect("write log");
        fs::write(temp.path().join("plan.json"), "{}\n").expect("write plan");
        assert_eq!(git.state(), WorktreeState::Available { dirty: false });

        fs::write(temp.path().join("lib.rs"), "fn main() {}\n").expect("write source");
        assert_eq!(git.changed_paths().expect("status"), vec!["lib.rs"]);
        assert!(git.commit_all("planrun: step").expect("commit"));
        assert_eq!(tracked_files(temp.path()), vec!["lib.rs"]);
    }

    #[test]
    fn excluded_paths_are_workdir_relative_and_unique() {
        let git = Git::new("/work/repo").excluding([
            PathBuf::from("/elsewhere/plan.json"),
            PathBuf::from("/work/repo/.planrun/"),
            PathBuf::from("./plan.json"),
            PathBuf::from("plan.json"),
        ]);
        assert_eq!(git.excluded, vec![".planrun", "plan.json"]);
    }
}
