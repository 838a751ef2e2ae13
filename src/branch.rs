//! Branch/visibility layer (C6): resolves which chunk_ids are visible for
//! a given `(path, branch)` pair, and prunes stale vectors whose source
//! files no longer exist or no longer qualify for indexing.
//!
//! The git interface shells out to the `git` binary rather than linking
//! `git2`, mirroring the minimal read-only git probing used by the
//! retrieval-manager code this module is grounded on: a handful of
//! `rev-parse`/`diff --name-only` calls, each tolerant of `git` being
//! absent (the engine degrades to single-branch mode).

use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;

use crate::error::AppResult;
use crate::vectorstore::{PointFilter, VectorStore};

/// Read-only git probing. Every method degrades to `None`/`false` when
/// `git` is not on PATH or the directory is not a repository, so callers
/// never need a separate "no git" code path.
pub struct GitInterface;

impl GitInterface {
    pub fn is_git_repo(path: &Path) -> bool {
        Command::new("git")
            .args(["rev-parse", "--git-dir"])
            .current_dir(path)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    pub fn current_branch(repo_path: &Path) -> Option<String> {
        let output = Command::new("git")
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .current_dir(repo_path)
            .output()
            .ok()?;
        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            None
        }
    }

    pub fn current_commit(repo_path: &Path) -> Option<String> {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(repo_path)
            .output()
            .ok()?;
        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            None
        }
    }

    pub fn merge_base(repo_path: &Path, a: &str, b: &str) -> Option<String> {
        let output = Command::new("git")
            .args(["merge-base", a, b])
            .current_dir(repo_path)
            .output()
            .ok()?;
        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            None
        }
    }

    /// Files tracked by git at HEAD, relative to `repo_path`. Used to
    /// cross-check `prune`'s "file missing" determination against the
    /// working tree rather than git's index when the two diverge (e.g. an
    /// untracked file that was indexed anyway).
    pub fn tracked_files(repo_path: &Path) -> Option<Vec<String>> {
        let output = Command::new("git")
            .args(["ls-files"])
            .current_dir(repo_path)
            .output()
            .ok()?;
        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).lines().map(|s| s.to_string()).collect())
        } else {
            None
        }
    }

    pub fn changed_files_since(repo_path: &Path, commit: &str) -> Option<Vec<String>> {
        let output = Command::new("git")
            .args(["diff", "--name-only", commit, "HEAD"])
            .current_dir(repo_path)
            .output()
            .ok()?;
        if output.status.success() {
            Some(String::from_utf8_lossy(&output.stdout).lines().map(|s| s.to_string()).collect())
        } else {
            None
        }
    }
}

/// Per-(collection, branch) visibility table: which chunk_ids are visible
/// on that branch for a given path. Absent a git repository, everything
/// indexes onto a single implicit branch (`"default"`) and this table is
/// just an identity mapping maintained for API uniformity.
#[derive(Default)]
pub struct VisibilityLayer {
    tables: DashMap<(String, String), DashMap<String, Vec<String>>>,
}

impl VisibilityLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_visible(&self, collection: &str, branch: &str, path: &str, chunk_ids: Vec<String>) {
        let key = (collection.to_string(), branch.to_string());
        let entry = self.tables.entry(key).or_default();
        entry.insert(path.to_string(), chunk_ids);
    }

    pub fn visible_chunk_ids(&self, collection: &str, branch: &str, path: &str) -> Option<Vec<String>> {
        let key = (collection.to_string(), branch.to_string());
        self.tables.get(&key).and_then(|t| t.get(path).map(|v| v.clone()))
    }

    pub fn remove_path(&self, collection: &str, branch: &str, path: &str) -> Option<Vec<String>> {
        let key = (collection.to_string(), branch.to_string());
        self.tables.get(&key).and_then(|t| t.remove(path).map(|(_, v)| v))
    }
}

// Note: there is no `force_include_patterns`/`force_exclude_patterns`
// configuration surface in `AppConfig` yet (spec.md's filter-configuration
// table names it as an external collaborator's concern), so `classify`
// only re-checks the predicates the pipeline itself applies on index:
// directory exclusion, extension eligibility, gitignore rules, max file
// size, and binary detection. There is deliberately no "override_excluded"
// report field until that configuration surface exists.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PruneReport {
    pub gitignored: usize,
    pub extension_excluded: usize,
    pub directory_excluded: usize,
    pub size_exceeded: usize,
    pub file_missing: usize,
    pub binary: usize,
    pub total_pruned: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct PruneOptions {
    pub batch_size: usize,
    pub dry_run: bool,
    pub max_file_size_bytes: u64,
}

impl Default for PruneOptions {
    fn default() -> Self {
        Self { batch_size: 1000, dry_run: false, max_file_size_bytes: 10 * 1024 * 1024 }
    }
}

enum PruneReason {
    FileMissing,
    DirectoryExcluded,
    ExtensionExcluded,
    Gitignored,
    SizeExceeded,
    Binary,
}

/// Walks every indexed path in `collection`, classifies why it no longer
/// qualifies (if at all), and deletes the disqualified chunk_ids in
/// batches. `project_root` is used to re-check the file's current
/// existence and eligibility against the same rules the pipeline applies
/// on index.
pub fn prune(
    store: &VectorStore,
    collection: &str,
    project_root: &Path,
    options: &PruneOptions,
    cancelled: &AtomicBool,
) -> AppResult<PruneReport> {
    let mut report = PruneReport { dry_run: options.dry_run, ..Default::default() };
    let mut to_delete: Vec<String> = Vec::new();
    let gitignore = build_gitignore(project_root);

    let mut cursor = None;
    loop {
        if cancelled.load(Ordering::Relaxed) {
            break;
        }
        let (page, next) = store.scroll(collection, &PointFilter::default(), cursor, 500)?;
        if page.is_empty() && next.is_none() {
            break;
        }

        for (chunk_id, payload) in page {
            if cancelled.load(Ordering::Relaxed) {
                break;
            }
            let reason = classify(project_root, &payload.path, &gitignore, options.max_file_size_bytes);
            match reason {
                None => continue,
                Some(PruneReason::FileMissing) => report.file_missing += 1,
                Some(PruneReason::DirectoryExcluded) => report.directory_excluded += 1,
                Some(PruneReason::ExtensionExcluded) => report.extension_excluded += 1,
                Some(PruneReason::Gitignored) => report.gitignored += 1,
                Some(PruneReason::SizeExceeded) => report.size_exceeded += 1,
                Some(PruneReason::Binary) => report.binary += 1,
            }
            report.total_pruned += 1;
            to_delete.push(chunk_id);
        }

        if next.is_none() {
            break;
        }
        cursor = next;
    }

    if !options.dry_run {
        store.begin_indexing(collection)?;
        for batch in to_delete.chunks(options.batch_size.max(1)) {
            if cancelled.load(Ordering::Relaxed) {
                break;
            }
            store.delete(collection, batch, false)?;
        }
        store.end_indexing(collection, false)?;
    }

    Ok(report)
}

/// Builds a gitignore matcher rooted at `project_root`, tolerant of a
/// missing or absent `.gitignore` (degrades to matching nothing), mirroring
/// the pipeline's `WalkBuilder` which enables `git_ignore`/`git_exclude` by
/// default.
fn build_gitignore(project_root: &Path) -> ignore::gitignore::Gitignore {
    let mut builder = ignore::gitignore::GitignoreBuilder::new(project_root);
    builder.add(project_root.join(".gitignore"));
    builder.build().unwrap_or_else(|_| ignore::gitignore::Gitignore::empty())
}

fn classify(
    project_root: &Path,
    relative_path: &str,
    gitignore: &ignore::gitignore::Gitignore,
    max_file_size_bytes: u64,
) -> Option<PruneReason> {
    let absolute = project_root.join(relative_path);
    if !absolute.exists() {
        return Some(PruneReason::FileMissing);
    }
    if crate::pipeline::is_build_or_output_dir(&absolute) {
        return Some(PruneReason::DirectoryExcluded);
    }
    if !crate::pipeline::is_indexable(&absolute) {
        return Some(PruneReason::ExtensionExcluded);
    }
    if gitignore.matched(&absolute, false).is_ignore() {
        return Some(PruneReason::Gitignored);
    }
    if let Ok(metadata) = std::fs::metadata(&absolute) {
        if metadata.len() > max_file_size_bytes {
            return Some(PruneReason::SizeExceeded);
        }
    }
    if let Ok(bytes) = std::fs::read(&absolute) {
        if crate::chunker::looks_binary(&bytes) {
            return Some(PruneReason::Binary);
        }
    }
    None
}

/// Resolves the effective branch identity for a project directory: the
/// current git branch/commit when `project_root` is a repository, or the
/// `"default"` single-branch fallback otherwise.
#[derive(Debug, Clone)]
pub struct BranchContext {
    pub branch: String,
    pub commit: Option<String>,
    pub is_git: bool,
}

pub fn resolve_branch_context(project_root: &Path) -> BranchContext {
    if GitInterface::is_git_repo(project_root) {
        BranchContext {
            branch: GitInterface::current_branch(project_root).unwrap_or_else(|| "default".to_string()),
            commit: GitInterface::current_commit(project_root),
            is_git: true,
        }
    } else {
        BranchContext { branch: "default".to_string(), commit: None, is_git: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_branch_context_non_git_defaults() {
        let dir = tempdir().unwrap();
        let ctx = resolve_branch_context(dir.path());
        assert!(!ctx.is_git);
        assert_eq!(ctx.branch, "default");
    }

    #[test]
    fn test_visibility_layer_set_and_get() {
        let layer = VisibilityLayer::new();
        layer.set_visible("col", "main", "src/a.rs", vec!["c1".to_string()]);
        assert_eq!(layer.visible_chunk_ids("col", "main", "src/a.rs"), Some(vec!["c1".to_string()]));
        assert_eq!(layer.visible_chunk_ids("col", "other", "src/a.rs"), None);
    }

    #[test]
    fn test_classify_missing_file() {
        let dir = tempdir().unwrap();
        let gitignore = build_gitignore(dir.path());
        assert!(matches!(
            classify(dir.path(), "does/not/exist.rs", &gitignore, 10 * 1024 * 1024),
            Some(PruneReason::FileMissing)
        ));
    }

    #[test]
    fn test_classify_gitignored_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "secrets.rs\n").unwrap();
        std::fs::write(dir.path().join("secrets.rs"), "fn x() {}").unwrap();
        let gitignore = build_gitignore(dir.path());
        assert!(matches!(
            classify(dir.path(), "secrets.rs", &gitignore, 10 * 1024 * 1024),
            Some(PruneReason::Gitignored)
        ));
    }

    #[test]
    fn test_classify_size_exceeded() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("big.rs"), vec![b'a'; 100]).unwrap();
        let gitignore = build_gitignore(dir.path());
        assert!(matches!(classify(dir.path(), "big.rs", &gitignore, 10), Some(PruneReason::SizeExceeded)));
        assert!(classify(dir.path(), "big.rs", &gitignore, 1000).is_none());
    }
}
