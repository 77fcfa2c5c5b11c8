use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Canonicalises `root` and checks that it is an existing, absolute
/// directory. All other path-accepting operations in the engine must
/// resolve their inputs through this or `resolve_inside` before touching
/// the filesystem.
pub fn validate_project_dir(root: &Path) -> Result<PathBuf> {
    if !root.is_absolute() {
        bail!("projectDir must be an absolute path: {}", root.display());
    }
    let canonical = root
        .canonicalize()
        .with_context(|| format!("projectDir does not exist: {}", root.display()))?;
    if !canonical.is_dir() {
        bail!("projectDir is not a directory: {}", canonical.display());
    }
    Ok(canonical)
}

/// Resolves `candidate` relative to `root`, rejecting traversal outside the
/// project root and symlink escapes via a resolved-path prefix check.
pub fn resolve_inside(root: &Path, candidate: &Path) -> Result<PathBuf> {
    let root = normalize(root);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };
    let normalized = normalize(&joined);
    if !normalized.starts_with(&root) {
        bail!(
            "path escapes project root: {} not under {}",
            normalized.display(),
            root.display()
        );
    }
    // If the path already exists, canonicalize it to catch symlink escapes;
    // non-existent paths (about to be created) are checked lexically only.
    if let Ok(resolved) = normalized.canonicalize() {
        let canonical_root = root.canonicalize().unwrap_or(root.clone());
        if !resolved.starts_with(&canonical_root) {
            bail!(
                "resolved path escapes project root via symlink: {}",
                resolved.display()
            );
        }
    }
    Ok(normalized)
}

/// Lexical `.`/`..` normalisation without requiring the path to exist.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                out.pop();
            }
            std::path::Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// The fixed file layout under a project's orchestrator directory.
#[derive(Debug, Clone)]
pub struct OrchestratorPaths {
    pub root: PathBuf,
}

impl OrchestratorPaths {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            root: project_dir.join(".loom").join("orchestrator"),
        }
    }

    pub fn state_file(&self) -> PathBuf {
        self.root.join("state.json")
    }

    pub fn progress_file(&self) -> PathBuf {
        self.root.join("progress.txt")
    }

    pub fn init_script(&self) -> PathBuf {
        self.root.join("init.sh")
    }

    pub fn workers_dir(&self) -> PathBuf {
        self.root.join("workers")
    }

    pub fn worker_log(&self, feature_id: &str) -> PathBuf {
        self.workers_dir().join(format!("{feature_id}.log"))
    }

    pub fn worker_done(&self, feature_id: &str) -> PathBuf {
        self.workers_dir().join(format!("{feature_id}.done"))
    }

    pub fn worker_plan(&self, feature_id: &str) -> PathBuf {
        self.workers_dir().join(format!("{feature_id}.plan.json"))
    }

    pub fn protocols_dir(&self) -> PathBuf {
        self.root.join("protocols")
    }

    pub fn protocol_registry_file(&self) -> PathBuf {
        self.protocols_dir().join("registry.json")
    }

    pub fn distribution_dir(&self) -> PathBuf {
        self.protocols_dir().join("distribution")
    }

    pub fn distribution_peers_file(&self) -> PathBuf {
        self.distribution_dir().join("peers.json")
    }

    pub fn distribution_export(&self, bundle_id: &str) -> PathBuf {
        self.distribution_dir()
            .join("exports")
            .join(format!("{bundle_id}.json"))
    }

    pub fn proposals_dir(&self) -> PathBuf {
        self.root.join("proposals")
    }

    pub fn proposal_file(&self, proposal_id: &str) -> PathBuf {
        self.proposals_dir().join(format!("{proposal_id}.json"))
    }

    pub fn sync_dir(&self) -> PathBuf {
        self.root.join("sync")
    }

    pub fn sync_instances_dir(&self) -> PathBuf {
        self.sync_dir().join("instances")
    }

    pub fn sync_instance_file(&self, instance_id: &str) -> PathBuf {
        self.sync_instances_dir().join(format!("{instance_id}.json"))
    }

    pub fn sync_messages_dir(&self) -> PathBuf {
        self.sync_dir().join("messages")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn resolve_inside_rejects_parent_traversal() {
        let root = Path::new("/tmp/project");
        let err = resolve_inside(root, Path::new("../outside")).unwrap_err();
        assert!(err.to_string().contains("escapes project root"));
    }

    #[test]
    fn resolve_inside_accepts_nested_relative_path() {
        let root = Path::new("/tmp/project");
        let resolved = resolve_inside(root, Path::new("workers/a.log")).unwrap();
        assert_eq!(resolved, Path::new("/tmp/project/workers/a.log"));
    }

    #[test]
    fn orchestrator_paths_layout() {
        let paths = OrchestratorPaths::new(Path::new("/tmp/project"));
        assert_eq!(
            paths.state_file(),
            Path::new("/tmp/project/.loom/orchestrator/state.json")
        );
        assert_eq!(
            paths.worker_done("feature-1"),
            Path::new("/tmp/project/.loom/orchestrator/workers/feature-1.done")
        );
    }
}
