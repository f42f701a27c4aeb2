//! Structural repair for self-nested artifact roots.
//!
//! A known agent failure mode is recreating the project inside itself,
//! producing `app/app/<project files>`. After any mutation the nested copy
//! is merged up into the root (inner files win) and removed.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::domain::{Result, StepwrightError};

/// Nesting levels collapsed in a single call.
const MAX_NESTING_LEVELS: usize = 8;

/// Files that mark a directory as a project root.
pub fn default_markers() -> Vec<String> {
    ["Cargo.toml", "package.json", "pubspec.yaml", "pyproject.toml", "go.mod"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Structural repair settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepairConfig {
    pub enabled: bool,
    /// Marker files; an empty list matches on directory name alone.
    pub markers: Vec<String>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            markers: default_markers(),
        }
    }
}

/// What a repair pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    /// The first nested duplicate found, if any.
    pub nested_root: Option<PathBuf>,
    pub levels_collapsed: usize,
    pub files_moved: usize,
    /// Root-relative paths replaced by the inner copy.
    pub overwritten: Vec<PathBuf>,
}

impl RepairReport {
    pub fn repaired(&self) -> bool {
        self.levels_collapsed > 0
    }
}

/// Locate a nested duplicate of `root` one level down.
pub fn find_nested_root(root: &Path, config: &RepairConfig) -> Option<PathBuf> {
    let root = fs::canonicalize(root).ok()?;
    let name = root.file_name()?;
    let candidate = root.join(name);
    if !candidate.is_dir() {
        return None;
    }
    if config.markers.is_empty() || config.markers.iter().any(|m| candidate.join(m).exists()) {
        Some(candidate)
    } else {
        None
    }
}

/// Collapse any self-nested duplicate of `root`. A flat tree is left untouched.
pub fn repair_if_nested(root: &Path, config: &RepairConfig) -> Result<RepairReport> {
    let mut report = RepairReport::default();
    if !config.enabled {
        return Ok(report);
    }

    while let Some(nested) = find_nested_root(root, config) {
        if report.levels_collapsed >= MAX_NESTING_LEVELS {
            warn!(root = %root.display(), "nesting deeper than repair bound; leaving remainder");
            break;
        }
        if report.nested_root.is_none() {
            report.nested_root = Some(nested.clone());
        }
        let root = nested
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.to_path_buf());
        collapse(&root, &nested, &mut report)?;
        report.levels_collapsed += 1;
    }

    if report.repaired() {
        info!(
            root = %root.display(),
            levels = report.levels_collapsed,
            files_moved = report.files_moved,
            overwritten = report.overwritten.len(),
            "collapsed nested project root"
        );
    }
    Ok(report)
}

fn collapse(root: &Path, nested: &Path, report: &mut RepairReport) -> Result<()> {
    // Move the inner copy aside so its own children can land at `root/<name>`.
    let staging = root.join(format!(".stepwright-nested-{}", uuid::Uuid::new_v4().simple()));
    fs::rename(nested, &staging)?;

    if let Err(e) = merge_staged(root, &staging, report) {
        // Whatever was not merged goes back under its original name.
        if let Err(restore) = fs::rename(&staging, nested) {
            warn!(
                staging = %staging.display(),
                error = %restore,
                "failed to restore nested root after aborted merge"
            );
        }
        return Err(e);
    }
    fs::remove_dir_all(&staging)?;
    Ok(())
}

fn merge_staged(root: &Path, staging: &Path, report: &mut RepairReport) -> Result<()> {
    let entries: Vec<_> = WalkDir::new(staging)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| StepwrightError::Io(e.into()))?;

    for entry in entries {
        let rel = entry
            .path()
            .strip_prefix(staging)
            .map_err(|e| StepwrightError::RepairConflict {
                path: entry.path().display().to_string(),
                reason: e.to_string(),
            })?
            .to_path_buf();
        let target = root.join(&rel);

        if entry.file_type().is_dir() {
            if target.exists() && !target.is_dir() {
                fs::remove_file(&target)?;
                report.overwritten.push(rel.clone());
            }
            fs::create_dir_all(&target)?;
            continue;
        }

        if target.is_dir() {
            fs::remove_dir_all(&target)?;
            report.overwritten.push(rel.clone());
        } else if target.exists() || target.is_symlink() {
            fs::remove_file(&target)?;
            report.overwritten.push(rel.clone());
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(entry.path(), &target)?;
        report.files_moved += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(dir: &Path) -> PathBuf {
        let root = dir.join("app");
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("Cargo.toml"), "outer").unwrap();
        fs::write(root.join("src/lib.rs"), "outer lib").unwrap();
        root
    }

    #[test]
    fn test_flat_tree_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let root = project(dir.path());
        let report = repair_if_nested(&root, &RepairConfig::default()).unwrap();
        assert!(!report.repaired());
        assert_eq!(fs::read_to_string(root.join("src/lib.rs")).unwrap(), "outer lib");
    }

    #[test]
    fn test_inner_files_win() {
        let dir = tempfile::tempdir().unwrap();
        let root = project(dir.path());
        let inner = root.join("app");
        fs::create_dir_all(inner.join("src")).unwrap();
        fs::write(inner.join("Cargo.toml"), "inner").unwrap();
        fs::write(inner.join("src/main.rs"), "inner main").unwrap();

        let report = repair_if_nested(&root, &RepairConfig::default()).unwrap();
        assert!(report.repaired());
        assert_eq!(report.files_moved, 2);
        assert_eq!(report.overwritten, vec![PathBuf::from("Cargo.toml")]);
        assert!(!root.join("app").exists());
        assert_eq!(fs::read_to_string(root.join("Cargo.toml")).unwrap(), "inner");
        assert_eq!(fs::read_to_string(root.join("src/lib.rs")).unwrap(), "outer lib");
        assert_eq!(fs::read_to_string(root.join("src/main.rs")).unwrap(), "inner main");
    }

    #[test]
    fn test_same_named_dir_without_marker_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let root = project(dir.path());
        fs::create_dir_all(root.join("app")).unwrap();
        fs::write(root.join("app/notes.txt"), "not a project").unwrap();

        let report = repair_if_nested(&root, &RepairConfig::default()).unwrap();
        assert!(!report.repaired());
        assert!(root.join("app/notes.txt").exists());
    }

    #[test]
    fn test_double_nesting_collapses_fully() {
        let dir = tempfile::tempdir().unwrap();
        let root = project(dir.path());
        let deepest = root.join("app").join("app");
        fs::create_dir_all(&deepest).unwrap();
        fs::write(root.join("app/Cargo.toml"), "middle").unwrap();
        fs::write(deepest.join("Cargo.toml"), "deepest").unwrap();

        let report = repair_if_nested(&root, &RepairConfig::default()).unwrap();
        assert_eq!(report.levels_collapsed, 2);
        assert!(!root.join("app").exists());
        assert_eq!(fs::read_to_string(root.join("Cargo.toml")).unwrap(), "deepest");
    }

    #[test]
    fn test_failed_merge_restores_nested_root() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let root = project(dir.path());
        let locked = root.join("locked");
        fs::create_dir_all(&locked).unwrap();
        let inner = root.join("app");
        fs::create_dir_all(inner.join("locked")).unwrap();
        fs::write(inner.join("Cargo.toml"), "inner").unwrap();
        fs::write(inner.join("locked/new.txt"), "blocked").unwrap();

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o555)).unwrap();
        if fs::write(locked.join(".writable"), "").is_ok() {
            // Permissions are not enforced for this user.
            fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }

        let result = repair_if_nested(&root, &RepairConfig::default());
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        assert!(result.is_err());
        assert!(root.join("app/locked/new.txt").exists());
        let staged = fs::read_dir(&root)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with(".stepwright-nested-"));
        assert!(!staged, "staging directory left behind");
    }

    #[test]
    fn test_disabled_repair_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let root = project(dir.path());
        fs::create_dir_all(root.join("app")).unwrap();
        fs::write(root.join("app/Cargo.toml"), "inner").unwrap();

        let config = RepairConfig {
            enabled: false,
            ..Default::default()
        };
        let report = repair_if_nested(&root, &config).unwrap();
        assert!(!report.repaired());
        assert!(root.join("app/Cargo.toml").exists());
    }
}
