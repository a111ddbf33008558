//! Version-control capability.
//!
//! The engine only needs four operations: detect a repository, list changed
//! files, commit everything, and hard-reset to a reference. [`GitTracker`]
//! implements them with `git2`; its absence (or a directory that is not a
//! repository) simply disables auto-commit and the fix loop.

use anyhow::{Context, Result};
use git2::{IndexAddOption, Repository, ResetType, Signature, Status, StatusOptions};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub trait VersionControl: Send + Sync {
    /// Whether the project directory is inside a repository.
    fn is_repository(&self) -> bool;

    /// Files with uncommitted changes (including untracked), relative to
    /// the project directory.
    fn changed_files(&self) -> Result<Vec<String>>;

    /// Stage everything and commit; returns the new commit id.
    fn commit(&self, message: &str) -> Result<String>;

    /// Reset index and tree to `reference`, removing untracked files.
    fn hard_reset(&self, reference: &str) -> Result<()>;

    /// Current HEAD commit id (None for unborn branches or no repository).
    fn head(&self) -> Option<String>;
}

/// git2-backed [`VersionControl`].
///
/// The repository is opened per call so the tracker stays `Send + Sync`.
/// Excluded directories (the phaser workspace) are never listed, staged, or
/// cleaned.
#[derive(Debug, Clone)]
pub struct GitTracker {
    project_dir: PathBuf,
    excluded: Vec<PathBuf>,
}

fn canonical(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => canonical(parent).join(name),
        _ => path.to_path_buf(),
    }
}

impl GitTracker {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            project_dir: canonical(project_dir),
            excluded: Vec::new(),
        }
    }

    /// Ignore everything under `dir` (relative paths are project-relative).
    pub fn with_excluded(mut self, dir: &Path) -> Self {
        let dir = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            self.project_dir.join(dir)
        };
        self.excluded.push(canonical(&dir));
        self
    }

    fn is_excluded(&self, workdir: &Path, path: &Path) -> bool {
        let full = workdir.join(path);
        self.excluded.iter().any(|dir| full.starts_with(dir))
    }

    fn repo(&self) -> Result<Repository> {
        Repository::discover(&self.project_dir).context("Failed to open git repository")
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn head_commit(repo: &Repository) -> Option<git2::Commit<'_>> {
        repo.head().ok().and_then(|head| head.peel_to_commit().ok())
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        match repo.signature() {
            Ok(sig) => Ok(sig.to_owned()),
            Err(_) => Signature::now("phaser", "phaser@localhost").context("Failed to build signature"),
        }
    }

    fn statuses(&self, repo: &Repository) -> Result<Vec<(PathBuf, Status)>> {
        let workdir = repo.workdir().context("Repository has no working directory")?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);
        let statuses = repo.statuses(Some(&mut opts))?;
        Ok(statuses
            .iter()
            .filter(|entry| entry.status() != Status::CURRENT && !entry.status().contains(Status::IGNORED))
            .filter_map(|entry| entry.path().map(|p| (PathBuf::from(p), entry.status())))
            .filter(|(path, _)| !self.is_excluded(workdir, path))
            .collect())
    }

    /// Express a workdir-relative path relative to the project directory.
    fn project_relative(&self, workdir: &Path, path: &Path) -> String {
        let full = workdir.join(path);
        match full.strip_prefix(&self.project_dir) {
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => full.to_string_lossy().into_owned(),
        }
    }
}

impl VersionControl for GitTracker {
    fn is_repository(&self) -> bool {
        self.repo().is_ok_and(|repo| !repo.is_bare())
    }

    fn changed_files(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let workdir = repo.workdir().context("Repository has no working directory")?.to_path_buf();
        let mut files: Vec<String> = self
            .statuses(&repo)?
            .into_iter()
            .map(|(path, _)| self.project_relative(&workdir, &path))
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }

    fn commit(&self, message: &str) -> Result<String> {
        let repo = self.repo()?;
        let workdir = repo.workdir().context("Repository has no working directory")?.to_path_buf();
        let mut skip_excluded = |path: &Path, _spec: &[u8]| -> i32 {
            if self.is_excluded(&workdir, path) { 1 } else { 0 }
        };
        let callback: &mut git2::IndexMatchedPath<'_> = &mut skip_excluded;
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, Some(&mut *callback))?;
        // add_all does not stage deletions
        index.update_all(["*"].iter(), Some(&mut *callback))?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;

        let commit_id = match Self::head_commit(&repo) {
            Some(parent) => repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?,
            None => repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?,
        };
        debug!(commit = %commit_id, "Created commit");
        Ok(commit_id.to_string())
    }

    fn hard_reset(&self, reference: &str) -> Result<()> {
        let repo = self.repo()?;
        let target = repo
            .revparse_single(reference)
            .with_context(|| format!("Unknown reference '{}'", reference))?;
        let commit = target.peel_to_commit()?;
        repo.reset(commit.as_object(), ResetType::Hard, None)
            .with_context(|| format!("Failed to reset to {}", reference))?;

        let workdir = repo.workdir().context("Repository has no working directory")?.to_path_buf();
        for (path, status) in self.statuses(&repo)? {
            if status.contains(Status::WT_NEW) {
                let full = workdir.join(&path);
                fs::remove_file(&full).with_context(|| format!("Failed to remove {}", full.display()))?;
            }
        }
        debug!(reference, "Hard reset working tree");
        Ok(())
    }

    fn head(&self) -> Option<String> {
        let repo = self.repo().ok()?;
        Self::head_commit(&repo).map(|c| c.id().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup_repo() -> (GitTracker, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        let mut config = repo.config().unwrap();
        config.set_str("user.name", "test").unwrap();
        config.set_str("user.email", "test@test.com").unwrap();
        drop(config);
        let tracker = GitTracker::new(dir.path());
        (tracker, dir)
    }

    #[test]
    fn test_not_a_repository() {
        let dir = tempdir().unwrap();
        let tracker = GitTracker::new(dir.path());
        assert!(!tracker.is_repository());
        assert!(tracker.head().is_none());
    }

    #[test]
    fn test_head_unborn_then_populated() {
        let (tracker, dir) = setup_repo();
        assert!(tracker.is_repository());
        assert!(tracker.head().is_none());
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let sha = tracker.commit("init").unwrap();
        assert_eq!(tracker.head(), Some(sha.clone()));
        assert_eq!(sha.len(), 40);
    }

    #[test]
    fn test_changed_files_includes_untracked_and_modified() {
        let (tracker, dir) = setup_repo();
        fs::write(dir.path().join("existing.txt"), "one\n").unwrap();
        tracker.commit("init").unwrap();
        assert!(tracker.changed_files().unwrap().is_empty());

        fs::write(dir.path().join("existing.txt"), "two\n").unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/new.rs"), "fn main() {}").unwrap();
        assert_eq!(
            tracker.changed_files().unwrap(),
            vec!["existing.txt".to_string(), "src/new.rs".to_string()]
        );
    }

    #[test]
    fn test_commit_stages_deletions() {
        let (tracker, dir) = setup_repo();
        fs::write(dir.path().join("gone.txt"), "bye").unwrap();
        tracker.commit("init").unwrap();
        fs::remove_file(dir.path().join("gone.txt")).unwrap();
        assert_eq!(tracker.changed_files().unwrap(), vec!["gone.txt".to_string()]);
        tracker.commit("remove").unwrap();
        assert!(tracker.changed_files().unwrap().is_empty());
    }

    #[test]
    fn test_hard_reset_restores_tree() {
        let (tracker, dir) = setup_repo();
        fs::write(dir.path().join("keep.txt"), "original").unwrap();
        let base = tracker.commit("init").unwrap();

        fs::write(dir.path().join("keep.txt"), "changed").unwrap();
        fs::write(dir.path().join("stray.txt"), "new").unwrap();
        tracker.hard_reset(&base).unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("keep.txt")).unwrap(), "original");
        assert!(!dir.path().join("stray.txt").exists());
        assert!(tracker.changed_files().unwrap().is_empty());
    }

    #[test]
    fn test_hard_reset_discards_later_commits() {
        let (tracker, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "1").unwrap();
        let base = tracker.commit("one").unwrap();
        fs::write(dir.path().join("a.txt"), "2").unwrap();
        tracker.commit("two").unwrap();

        tracker.hard_reset(&base).unwrap();
        assert_eq!(tracker.head(), Some(base));
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "1");
    }

    #[test]
    fn test_excluded_dir_is_invisible() {
        let (tracker, dir) = setup_repo();
        let tracker = tracker.with_excluded(Path::new(".phaser"));
        fs::write(dir.path().join("a.txt"), "1").unwrap();
        let base = tracker.commit("one").unwrap();

        fs::create_dir_all(dir.path().join(".phaser/plans")).unwrap();
        fs::write(dir.path().join(".phaser/plans/p.md"), "plan").unwrap();
        fs::write(dir.path().join("b.txt"), "2").unwrap();
        assert_eq!(tracker.changed_files().unwrap(), vec!["b.txt".to_string()]);

        tracker.commit("two").unwrap();
        tracker.hard_reset(&base).unwrap();
        assert!(dir.path().join(".phaser/plans/p.md").exists());
        assert!(!dir.path().join("b.txt").exists());
    }

    #[test]
    fn test_hard_reset_unknown_reference_errors() {
        let (tracker, dir) = setup_repo();
        fs::write(dir.path().join("a.txt"), "1").unwrap();
        tracker.commit("one").unwrap();
        assert!(tracker.hard_reset("does-not-exist").is_err());
    }
}
