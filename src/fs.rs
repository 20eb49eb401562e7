//! File timestamps, memoised per run. mtimes are gathered with `lstat`
//! semantics (symlinks are not followed) and merged over path sets to
//! answer "newest dependency" / "oldest target" queries.

use std::collections::HashMap;
use std::path::Path;
use std::time::SystemTime;

use crate::path::BuildPath;

/// MTime info gathered for a file. This also models "file is absent".
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MTime {
    Missing,
    Stamp(SystemTime),
}

impl MTime {
    fn stamp(self) -> Option<SystemTime> {
        match self {
            MTime::Missing => None,
            MTime::Stamp(t) => Some(t),
        }
    }
}

fn stat(root: &Path, path: &BuildPath) -> MTime {
    // Any stat failure, not just NotFound, counts as missing.
    match std::fs::symlink_metadata(path.resolve(root)) {
        Ok(meta) => match meta.modified() {
            Ok(t) => MTime::Stamp(t),
            Err(_) => MTime::Missing,
        },
        Err(_) => MTime::Missing,
    }
}

/// Result of merging timestamps over a path set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergedTimestamp {
    /// True when at least one path had no usable mtime.
    pub missing_files: bool,
    /// Merge-reduced mtime over the paths that were present.
    pub limit: Option<SystemTime>,
}

/// Per-run mtime cache.
#[derive(Default)]
pub struct TimestampCache {
    mtimes: HashMap<BuildPath, MTime>,
}

impl TimestampCache {
    pub fn new() -> TimestampCache {
        TimestampCache::default()
    }

    /// The file's mtime, from cache or a fresh stat.
    pub fn timestamp(&mut self, root: &Path, path: &BuildPath) -> Option<SystemTime> {
        if let Some(mtime) = self.mtimes.get(path) {
            return mtime.stamp();
        }
        let mtime = stat(root, path);
        self.mtimes.insert(path.clone(), mtime);
        mtime.stamp()
    }

    /// Re-stat, discarding any cached value. Used after an action has
    /// (re)written its targets.
    pub fn restat(&mut self, root: &Path, path: &BuildPath) -> Option<SystemTime> {
        let mtime = stat(root, path);
        self.mtimes.insert(path.clone(), mtime);
        mtime.stamp()
    }

    pub fn merge_timestamp<'a>(
        &mut self,
        root: &Path,
        paths: impl IntoIterator<Item = &'a BuildPath>,
        merge: impl Fn(SystemTime, SystemTime) -> SystemTime,
    ) -> MergedTimestamp {
        let mut acc = MergedTimestamp {
            missing_files: false,
            limit: None,
        };
        for path in paths {
            match self.timestamp(root, path) {
                None => acc.missing_files = true,
                Some(t) => {
                    acc.limit = Some(match acc.limit {
                        None => t,
                        Some(prev) => merge(prev, t),
                    });
                }
            }
        }
        acc
    }

    pub fn min_timestamp<'a>(
        &mut self,
        root: &Path,
        paths: impl IntoIterator<Item = &'a BuildPath>,
    ) -> MergedTimestamp {
        self.merge_timestamp(root, paths, std::cmp::min)
    }

    pub fn max_timestamp<'a>(
        &mut self,
        root: &Path,
        paths: impl IntoIterator<Item = &'a BuildPath>,
    ) -> MergedTimestamp {
        self.merge_timestamp(root, paths, std::cmp::max)
    }
}
