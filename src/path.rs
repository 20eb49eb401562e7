//! Paths as the build engine sees them: either local to the workspace
//! (relative to the engine root, creatable) or external (absolute,
//! never created by the engine).

use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Name of the build tree at the workspace root.
pub const BUILD_DIR: &str = "_build";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Kind {
    Local,
    External,
}

/// A path in the build engine's world view.
///
/// Local paths are relative and resolved against the engine root; external
/// paths are absolute and point outside the workspace. Only local paths may
/// be created or have directories made for them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BuildPath {
    kind: Kind,
    path: PathBuf,
}

impl BuildPath {
    /// A workspace-relative path.
    pub fn local(path: impl Into<PathBuf>) -> BuildPath {
        let path = path.into();
        debug_assert!(path.is_relative(), "local path must be relative: {:?}", path);
        BuildPath {
            kind: Kind::Local,
            path,
        }
    }

    /// An absolute path outside the workspace.
    pub fn external(path: impl Into<PathBuf>) -> BuildPath {
        let path = path.into();
        debug_assert!(path.is_absolute(), "external path must be absolute: {:?}", path);
        BuildPath {
            kind: Kind::External,
            path,
        }
    }

    pub fn is_local(&self) -> bool {
        self.kind == Kind::Local
    }

    /// True when the path lives under the build tree.
    pub fn is_in_build_dir(&self) -> bool {
        self.is_local()
            && self
                .path
                .components()
                .next()
                .is_some_and(|c| c == Component::Normal(OsStr::new(BUILD_DIR)))
    }

    /// Parent directory, if any. The empty parent of a bare file name
    /// counts as "no parent".
    pub fn parent(&self) -> Option<BuildPath> {
        let parent = self.path.parent()?;
        if parent.as_os_str().is_empty() {
            return None;
        }
        Some(BuildPath {
            kind: self.kind,
            path: parent.to_path_buf(),
        })
    }

    pub fn join(&self, seg: impl AsRef<Path>) -> BuildPath {
        BuildPath {
            kind: self.kind,
            path: self.path.join(seg),
        }
    }

    pub fn file_name(&self) -> Option<&OsStr> {
        self.path.file_name()
    }

    /// The on-disk location, given the engine root.
    pub fn resolve(&self, root: &Path) -> PathBuf {
        match self.kind {
            Kind::Local => root.join(&self.path),
            Kind::External => self.path.clone(),
        }
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for BuildPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}
