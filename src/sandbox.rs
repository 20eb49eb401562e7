//! Private per-rule directories. Only declared dependencies are staged
//! inside, so an action's undeclared reads fail; produced targets are
//! moved back out on success. On failure the directory is deliberately
//! left on disk for inspection.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::BuildError;
use crate::hash::Digest;
use crate::path::BuildPath;

/// Directory holding all sandboxes, under the build tree.
pub const SANDBOX_DIR: &str = "_build/.sandbox";

pub(crate) struct Sandbox {
    root: PathBuf,
    dir: BuildPath,
}

impl Sandbox {
    /// Wipes and recreates the sandbox for `digest`, staging parent
    /// directories for deps and targets, hard links (or copies) of the
    /// declared local deps, and copies of targets the action updates in
    /// place.
    pub fn create(
        root: &Path,
        digest: &Digest,
        deps: &BTreeSet<BuildPath>,
        targets: &BTreeSet<BuildPath>,
        updated: &BTreeSet<BuildPath>,
    ) -> Result<Sandbox, BuildError> {
        let dir = BuildPath::local(SANDBOX_DIR).join(digest.as_hex());
        let sandbox = Sandbox {
            root: root.to_path_buf(),
            dir,
        };

        let abs = sandbox.dir.resolve(root);
        match std::fs::remove_dir_all(&abs) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(BuildError::io(&sandbox.dir, err)),
        }
        std::fs::create_dir_all(&abs).map_err(|err| BuildError::io(&sandbox.dir, err))?;

        for dep in deps {
            if !dep.is_local() {
                continue;
            }
            let staged = sandbox.map_path(dep);
            sandbox.ensure_parent(&staged)?;
            let from = dep.resolve(root);
            let to = staged.resolve(root);
            if std::fs::hard_link(&from, &to).is_err() {
                std::fs::copy(&from, &to).map_err(|err| BuildError::io(dep, err))?;
            }
        }
        for target in targets {
            if !target.is_local() {
                continue;
            }
            let staged = sandbox.map_path(target);
            sandbox.ensure_parent(&staged)?;
            if updated.contains(target) {
                // Updated-in-place targets must be visible to the action;
                // copy rather than link so the original is untouched until
                // export.
                let from = target.resolve(root);
                if from.exists() {
                    std::fs::copy(&from, staged.resolve(root))
                        .map_err(|err| BuildError::io(target, err))?;
                }
            }
        }
        Ok(sandbox)
    }

    /// The sandboxed counterpart of a path. External paths are untouched.
    pub fn map_path(&self, path: &BuildPath) -> BuildPath {
        if path.is_local() {
            self.dir.join(path.as_path())
        } else {
            path.clone()
        }
    }

    fn ensure_parent(&self, path: &BuildPath) -> Result<(), BuildError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent.resolve(&self.root))
                .map_err(|err| BuildError::io(&parent, err))?;
        }
        Ok(())
    }

    /// Moves produced targets from the sandbox to their real locations.
    /// A target the action failed to produce is left to the caller's
    /// post-execution check.
    pub fn export_targets(&self, targets: &BTreeSet<BuildPath>) -> Result<(), BuildError> {
        for target in targets {
            if !target.is_local() {
                continue;
            }
            let staged = self.map_path(target).resolve(&self.root);
            if !staged.exists() {
                continue;
            }
            let real = target.resolve(&self.root);
            if std::fs::rename(&staged, &real).is_err() {
                // Rename can fail across filesystems; fall back to a copy.
                std::fs::copy(&staged, &real).map_err(|err| BuildError::io(target, err))?;
            }
        }
        Ok(())
    }

    /// Removes the sandbox directory. Success-path only; failures keep it
    /// around for inspection.
    pub fn remove(self) {
        let abs = self.dir.resolve(&self.root);
        if let Err(err) = std::fs::remove_dir_all(&abs) {
            debug!(dir = %abs.display(), "leaving sandbox behind: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::hash::hash_rule;

    fn digest() -> Digest {
        hash_rule(
            &BTreeSet::new(),
            &BTreeSet::new(),
            &Action::WriteFile {
                path: BuildPath::local("t"),
                contents: String::new(),
            },
        )
    }

    #[test]
    fn stages_declared_deps_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("declared"), "yes").unwrap();
        std::fs::write(dir.path().join("undeclared"), "no").unwrap();

        let deps: BTreeSet<_> = [BuildPath::local("declared")].into_iter().collect();
        let targets: BTreeSet<_> = [BuildPath::local("out")].into_iter().collect();
        let sandbox =
            Sandbox::create(dir.path(), &digest(), &deps, &targets, &BTreeSet::new()).unwrap();

        let staged_dep = sandbox.map_path(&BuildPath::local("declared"));
        assert!(staged_dep.resolve(dir.path()).exists());
        let staged_other = sandbox.map_path(&BuildPath::local("undeclared"));
        assert!(!staged_other.resolve(dir.path()).exists());
    }

    #[test]
    fn export_moves_targets_out_and_remove_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let targets: BTreeSet<_> = [BuildPath::local("out/result")].into_iter().collect();
        let sandbox = Sandbox::create(
            dir.path(),
            &digest(),
            &BTreeSet::new(),
            &targets,
            &BTreeSet::new(),
        )
        .unwrap();

        let staged = sandbox.map_path(&BuildPath::local("out/result"));
        std::fs::write(staged.resolve(dir.path()), "built").unwrap();
        std::fs::create_dir_all(dir.path().join("out")).unwrap();
        sandbox.export_targets(&targets).unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("out/result")).unwrap(),
            "built"
        );

        let abs = BuildPath::local(SANDBOX_DIR)
            .join(digest().as_hex())
            .resolve(dir.path());
        sandbox.remove();
        assert!(!abs.exists());
    }

    #[test]
    fn external_paths_are_not_mapped() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = Sandbox::create(
            dir.path(),
            &digest(),
            &BTreeSet::new(),
            &BTreeSet::new(),
            &BTreeSet::new(),
        )
        .unwrap();
        let ext = BuildPath::external("/usr/bin/cc");
        assert_eq!(sandbox.map_path(&ext), ext);
    }
}
