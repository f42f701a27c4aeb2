//! Dependency manifest fingerprinting.
//!
//! Dependency resolution is expensive, so the gate only runs it when the
//! manifest content changed since the last successful resolution. An
//! unreadable manifest always forces resolution.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Content digest of a manifest file, or `None` when it cannot be read.
pub fn manifest_digest(manifest: &Path) -> Option<String> {
    let bytes = std::fs::read(manifest).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(hex::encode(hasher.finalize()))
}

/// Tracks the last manifest digest for which resolution succeeded.
#[derive(Debug, Clone, Default)]
pub struct FingerprintTracker {
    state_path: Option<PathBuf>,
    recorded: Option<String>,
}

impl FingerprintTracker {
    /// Tracker with no backing file; forgets everything on drop.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Tracker persisted to `state_path`, seeded from it when present.
    pub fn persistent(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let recorded = std::fs::read_to_string(&state_path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Self {
            state_path: Some(state_path),
            recorded,
        }
    }

    pub fn recorded(&self) -> Option<&str> {
        self.recorded.as_deref()
    }

    /// True iff the manifest digest differs from the recorded one.
    pub fn should_resolve(&self, manifest: &Path) -> bool {
        match (manifest_digest(manifest), self.recorded.as_deref()) {
            (Some(current), Some(previous)) => {
                let changed = current != previous;
                debug!(manifest = %manifest.display(), changed, "manifest fingerprint compared");
                changed
            }
            (None, _) => {
                debug!(manifest = %manifest.display(), "manifest unreadable; forcing resolution");
                true
            }
            (Some(_), None) => true,
        }
    }

    /// Record the current digest after the caller confirmed resolution succeeded.
    pub fn record_resolved(&mut self, manifest: &Path) {
        let Some(digest) = manifest_digest(manifest) else {
            self.recorded = None;
            return;
        };
        if let Some(path) = &self.state_path {
            if let Err(e) = write_state(path, &digest) {
                warn!(path = %path.display(), error = %e, "failed to persist manifest fingerprint");
            }
        }
        self.recorded = Some(digest);
    }
}

fn write_state(path: &Path, digest: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, digest.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_call_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("Cargo.toml");
        std::fs::write(&manifest, "[package]\nname = \"a\"\n").unwrap();

        let tracker = FingerprintTracker::in_memory();
        assert!(tracker.should_resolve(&manifest));
    }

    #[test]
    fn test_unchanged_manifest_skips() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("Cargo.toml");
        std::fs::write(&manifest, "[package]\nname = \"a\"\n").unwrap();

        let mut tracker = FingerprintTracker::in_memory();
        tracker.record_resolved(&manifest);
        assert!(!tracker.should_resolve(&manifest));
    }

    #[test]
    fn test_changed_manifest_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("Cargo.toml");
        std::fs::write(&manifest, "a").unwrap();

        let mut tracker = FingerprintTracker::in_memory();
        tracker.record_resolved(&manifest);
        std::fs::write(&manifest, "b").unwrap();
        assert!(tracker.should_resolve(&manifest));
    }

    #[test]
    fn test_unreadable_manifest_always_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("missing.toml");

        let mut tracker = FingerprintTracker::in_memory();
        assert!(tracker.should_resolve(&manifest));
        tracker.record_resolved(&manifest);
        assert!(tracker.recorded().is_none());
        assert!(tracker.should_resolve(&manifest));
    }

    #[test]
    fn test_persistent_state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("package.json");
        let state = dir.path().join(".stepwright").join("manifest.sha256");
        std::fs::write(&manifest, "{}").unwrap();

        let mut tracker = FingerprintTracker::persistent(&state);
        tracker.record_resolved(&manifest);

        let reloaded = FingerprintTracker::persistent(&state);
        assert!(!reloaded.should_resolve(&manifest));
    }
}
