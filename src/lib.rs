//! An incremental build engine. Callers register pre-rules binding target
//! paths to build arrows; `do_build` realises requested targets by
//! discovering dependencies during arrow evaluation, running each rule's
//! action at most once and only when the trace digest or file timestamps
//! say its outputs are stale.

pub mod action;
pub mod build;
mod closure;
pub mod db;
pub mod error;
pub mod fs;
pub mod hash;
pub mod path;
pub mod rules;
mod sandbox;
pub mod work;

pub use crate::action::Action;
pub use crate::error::BuildError;
pub use crate::path::BuildPath;
pub use crate::rules::PreRule;
pub use crate::work::{Context, Engine};
