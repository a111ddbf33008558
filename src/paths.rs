//! Context file resolution against the two permitted roots.
//!
//! Entries prefixed `workspace/` resolve under the workspace root with the
//! prefix stripped; everything else resolves under the project root. A
//! resolved path must stay inside one of the roots both lexically and after
//! symlinks are followed. Files that do not exist yet are allowed as long as
//! their closest existing ancestor is inside a root.

use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::errors::PathError;

/// Prefix that routes a context file entry to the workspace root.
pub const WORKSPACE_PREFIX: &str = "workspace/";

/// Resolves context file entries for one project/workspace pair.
#[derive(Debug, Clone)]
pub struct PathResolver {
    project_root: PathBuf,
    workspace_root: PathBuf,
}

impl PathResolver {
    pub fn new(project_root: impl Into<PathBuf>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: normalize_lexically(&project_root.into()),
            workspace_root: normalize_lexically(&workspace_root.into()),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Resolve a context file entry to an absolute path.
    pub fn resolve(&self, entry: &str) -> Result<PathBuf, PathError> {
        let (base, relative) = match entry.strip_prefix(WORKSPACE_PREFIX) {
            Some(rest) => (&self.workspace_root, rest),
            None => (&self.project_root, entry),
        };

        let candidate = normalize_lexically(&base.join(relative));
        if !self.within_roots(&candidate, &self.project_root, &self.workspace_root) {
            return Err(PathError::OutOfBounds {
                path: entry.to_string(),
            });
        }

        let resolved = canonicalize_existing_prefix(&candidate)?;
        let project = canonical_or_lexical(&self.project_root);
        let workspace = canonical_or_lexical(&self.workspace_root);
        if !self.within_roots(&resolved, &project, &workspace) {
            return Err(PathError::SymlinkEscape {
                path: entry.to_string(),
                resolved,
            });
        }

        Ok(candidate)
    }

    /// Whether `entry` refers to the workspace root rather than the project.
    pub fn is_workspace_entry(entry: &str) -> bool {
        entry.starts_with(WORKSPACE_PREFIX)
    }

    fn within_roots(&self, path: &Path, project: &Path, workspace: &Path) -> bool {
        path.starts_with(project) || path.starts_with(workspace)
    }
}

/// Resolve `entry` against the given roots. See [`PathResolver::resolve`].
pub fn resolve(entry: &str, project_root: &Path, workspace_root: &Path) -> Result<PathBuf, PathError> {
    PathResolver::new(project_root, workspace_root).resolve(entry)
}

/// Collapse `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the root stays at the root
                if !out.pop() {
                    out.push(component.as_os_str());
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn canonical_or_lexical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Symlink hops followed before giving up and letting the OS report a loop.
const MAX_LINK_DEPTH: usize = 40;

/// Canonicalize the deepest existing ancestor of `path` and re-append the
/// components that do not exist yet.
///
/// Existence is judged with `symlink_metadata`, so a dangling link counts as
/// present and is followed to its target instead of being treated as a
/// file that has yet to be created.
fn canonicalize_existing_prefix(path: &Path) -> Result<PathBuf, PathError> {
    resolve_links(path, 0)
}

fn resolve_links(path: &Path, depth: usize) -> Result<PathBuf, PathError> {
    let mut existing = path.to_path_buf();
    let mut missing: Vec<OsString> = Vec::new();

    loop {
        match fs::symlink_metadata(&existing) {
            Ok(meta) if meta.file_type().is_symlink() && !existing.exists() => {
                let target = follow_dangling(&existing, depth)?;
                return Ok(append_missing(target, &missing));
            }
            Ok(_) => break,
            Err(_) => match (existing.file_name(), existing.parent()) {
                (Some(name), Some(parent)) => {
                    missing.push(name.to_os_string());
                    existing = parent.to_path_buf();
                }
                _ => return Ok(path.to_path_buf()),
            },
        }
    }

    let resolved = existing
        .canonicalize()
        .map_err(|source| PathError::Canonicalize {
            path: existing.clone(),
            source,
        })?;
    Ok(append_missing(resolved, &missing))
}

/// Where a link whose target does not exist would write to.
fn follow_dangling(link: &Path, depth: usize) -> Result<PathBuf, PathError> {
    let canonicalize_err = |source: std::io::Error| PathError::Canonicalize {
        path: link.to_path_buf(),
        source,
    };
    if depth >= MAX_LINK_DEPTH {
        // Yields ELOOP for cycles
        return link.canonicalize().map_err(canonicalize_err);
    }
    let target = fs::read_link(link).map_err(canonicalize_err)?;
    let parent = match link.parent() {
        Some(parent) => parent.canonicalize().map_err(canonicalize_err)?,
        None => PathBuf::from("/"),
    };
    resolve_links(&normalize_lexically(&parent.join(target)), depth + 1)
}

fn append_missing(mut base: PathBuf, missing: &[OsString]) -> PathBuf {
    for name in missing.iter().rev() {
        base.push(name);
    }
    base
}
