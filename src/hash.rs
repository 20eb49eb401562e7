//! A single digest over a rule's realised dependencies, declared targets,
//! and canonical action is recorded in the trace and compared across runs
//! to decide whether the rule's inputs changed.

use std::collections::BTreeSet;

use sha2::{Digest as _, Sha256};

use crate::action::Action;
use crate::path::BuildPath;

/// Hex-encoded digest identifying one configuration of a rule.
///
/// Persisted in the trace across runs, so it must be stable across
/// executions; hence a real hash function rather than the std hasher.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(String);

impl Digest {
    pub fn as_hex(&self) -> &str {
        &self.0
    }

    pub(crate) fn from_hex(hex: String) -> Digest {
        Digest(hex)
    }
}

const UNIT_SEPARATOR: u8 = 0x1f;
const GROUP_SEPARATOR: u8 = 0x1d;

fn write_paths<'a>(hasher: &mut Sha256, paths: impl IntoIterator<Item = &'a BuildPath>) {
    for p in paths {
        hasher.update(p.to_string().as_bytes());
        hasher.update([UNIT_SEPARATOR]);
    }
    hasher.update([GROUP_SEPARATOR]);
}

/// Digest of (sorted deps, sorted targets, canonical action).
pub fn hash_rule(
    deps: &BTreeSet<BuildPath>,
    targets: &BTreeSet<BuildPath>,
    action: &Action,
) -> Digest {
    let mut hasher = Sha256::new();
    write_paths(&mut hasher, deps);
    write_paths(&mut hasher, targets);
    hasher.update(action.canonical().as_bytes());
    Digest(format!("{:x}", hasher.finalize()))
}
