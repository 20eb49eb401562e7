//! Build failures, modeled as one sum type so they can flow unchanged
//! through shared futures and across rule boundaries.

use std::backtrace::Backtrace;
use std::sync::Arc;

use thiserror::Error;

use crate::path::BuildPath;

/// Any way a build can fail.
///
/// `Clone` because a rule's result is distributed to every waiter through a
/// shared future. I/O errors are therefore carried as rendered messages.
#[derive(Debug, Clone, Error)]
pub enum BuildError {
    /// A file inside the build tree that no rule produces.
    #[error("no rule found for {0}")]
    NoRule(BuildPath),

    /// A source file that does not exist on disk.
    #[error("file unavailable: {0}")]
    FileUnavailable(BuildPath),

    /// Two rules claim the same target path.
    #[error("multiple rules generated for {0}")]
    MultipleRules(BuildPath),

    /// Rule-level dependency cycle; the path starts and ends at the same file.
    #[error("{}", cycle_message(.0))]
    Cycle(Vec<BuildPath>),

    /// A memoized build arrow re-entered itself during evaluation.
    #[error("dependency cycle while evaluating memoized build arrow {0:?}")]
    MemoCycle(String),

    /// The action ran successfully but some declared targets never appeared.
    #[error("{}", targets_message(.0))]
    TargetsMissing(Vec<BuildPath>),

    /// An unconditional failure node in a build description.
    #[error("build description contains an unconditional failure")]
    Fail,

    /// The action itself failed; `message` includes any captured output.
    #[error("action failed: {message}")]
    ActionFailed { message: String },

    /// Filesystem trouble while preparing or finishing a rule.
    #[error("{path}: {message}")]
    Io { path: BuildPath, message: String },

    /// A failure below a rule, annotated with the chain of files whose
    /// realisation led to it and the stack captured where the original
    /// error was first wrapped. Assembled once at the faulting rule;
    /// outer frames propagate it verbatim.
    #[error("{}", rule_message(.dep_path, .cause))]
    Rule {
        dep_path: Vec<BuildPath>,
        cause: Arc<BuildError>,
        backtrace: Arc<Backtrace>,
    },

    /// A broken invariant inside the engine itself.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BuildError {
    pub(crate) fn io(path: &BuildPath, err: std::io::Error) -> BuildError {
        BuildError::Io {
            path: path.clone(),
            message: err.to_string(),
        }
    }
}

fn cycle_message(files: &[BuildPath]) -> String {
    let mut msg = String::from("Dependency cycle between the following files:");
    for (i, f) in files.iter().enumerate() {
        if i == 0 {
            msg.push_str(&format!("\n    {}", f));
        } else {
            msg.push_str(&format!("\n--> {}", f));
        }
    }
    msg
}

fn targets_message(targets: &[BuildPath]) -> String {
    let mut msg = String::from("Rule failed to generate the following targets:");
    for t in targets {
        msg.push_str(&format!("\n- {}", t));
    }
    msg
}

fn rule_message(dep_path: &[BuildPath], cause: &BuildError) -> String {
    let mut msg = cause.to_string();
    if !dep_path.is_empty() {
        msg.push_str("\nrequired by:");
        for f in dep_path {
            msg.push_str(&format!("\n    {}", f));
        }
    }
    msg
}
