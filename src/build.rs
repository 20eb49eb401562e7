//! Build arrows: composable descriptions of how to produce a value
//! (ultimately an action) while naming the files the computation depends
//! on. An arrow is data, not execution; two interpreters consume it. The
//! concrete one realises every named dependency before reading it, the
//! approximate one substitutes placeholder contents to predict
//! dependencies without building anything. Both share the single `eval`
//! walk below and differ only in their `Interp` implementation.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use futures::future::{self, LocalBoxFuture};
use futures::FutureExt;
use regex::Regex;

use crate::error::BuildError;
use crate::path::BuildPath;

/// A description of how to compute a `T` during a build.
///
/// Cheap to clone; clones share structure, including memo state.
pub struct Build<T>(Rc<Node<T>>);

impl<T> Clone for Build<T> {
    fn clone(&self) -> Self {
        Build(self.0.clone())
    }
}

enum Node<T> {
    Return(T),
    Fail,
    Prim {
        prim: Prim,
        post: Box<dyn Fn(PrimValue) -> T>,
    },
    /// Bind / Map / Both; the intermediate types are hidden behind the
    /// node structs implementing `DynEval`.
    Compound(Box<dyn DynEval<T>>),
    Memo {
        name: String,
        inner: Build<T>,
        state: RefCell<MemoState<T>>,
    },
}

/// First-order primitives, the leaves that name paths.
enum Prim {
    Contents(BuildPath),
    LinesOf(BuildPath),
    Paths(BTreeSet<BuildPath>),
    Glob { dir: BuildPath, matching: Regex },
    FileExists(BuildPath),
    RecordLibDeps { dir: BuildPath, deps: Vec<String> },
}

enum PrimValue {
    Unit,
    Text(String),
    Lines(Vec<String>),
    PathSet(Vec<BuildPath>),
    Truth(bool),
}

enum MemoState<T> {
    Unevaluated,
    Evaluating,
    Evaluated(T),
}

/// What an interpreter supplies to the shared `eval` walk.
pub(crate) trait Interp {
    /// Register `path` as a dependency and realise it before returning.
    fn force_dep<'a>(&'a self, path: &'a BuildPath)
        -> LocalBoxFuture<'a, Result<(), BuildError>>;
    /// Register dependencies whose realisation may be deferred to the
    /// aggregate wait after tree evaluation.
    fn defer_deps(&self, paths: &BTreeSet<BuildPath>);
    /// Contents of an already-realised dependency.
    fn read_file(&self, path: &BuildPath) -> Result<String, BuildError>;
    /// Registered targets in `dir` whose file name matches. Observes the
    /// target registry only, never the filesystem, and registers no
    /// dependency.
    fn glob_targets(&self, dir: &BuildPath, matching: &Regex) -> Vec<BuildPath>;
    /// True iff the path is a registered target (not: exists on disk).
    fn is_registered_target(&self, path: &BuildPath) -> bool;
    fn record_lib_deps(&self, dir: &BuildPath, deps: &[String]);
    /// Whether memo cells may cache values (concrete evaluation only;
    /// placeholder-derived values must not poison the cache).
    fn cache_memos(&self) -> bool;
    /// Non-caching memo cycle tracking. Returns false when the memo is
    /// already being evaluated by this interpreter.
    fn enter_memo(&self, _key: usize) -> bool {
        true
    }
    fn exit_memo(&self, _key: usize) {}
}

trait DynEval<T> {
    fn eval<'a>(&'a self, interp: &'a dyn Interp) -> LocalBoxFuture<'a, Result<T, BuildError>>;
}

struct BindNode<U, T> {
    first: Build<U>,
    cont: Box<dyn Fn(U) -> Build<T>>,
}

impl<U: Clone + 'static, T: Clone + 'static> DynEval<T> for BindNode<U, T> {
    fn eval<'a>(&'a self, interp: &'a dyn Interp) -> LocalBoxFuture<'a, Result<T, BuildError>> {
        async move {
            let first = self.first.eval(interp).await?;
            let next = (self.cont)(first);
            next.eval(interp).await
        }
        .boxed_local()
    }
}

struct MapNode<U, T> {
    first: Build<U>,
    f: Box<dyn Fn(U) -> T>,
}

impl<U: Clone + 'static, T: Clone + 'static> DynEval<T> for MapNode<U, T> {
    fn eval<'a>(&'a self, interp: &'a dyn Interp) -> LocalBoxFuture<'a, Result<T, BuildError>> {
        async move { Ok((self.f)(self.first.eval(interp).await?)) }.boxed_local()
    }
}

struct BothNode<U, V> {
    left: Build<U>,
    right: Build<V>,
}

impl<U: Clone + 'static, V: Clone + 'static> DynEval<(U, V)> for BothNode<U, V> {
    fn eval<'a>(
        &'a self,
        interp: &'a dyn Interp,
    ) -> LocalBoxFuture<'a, Result<(U, V), BuildError>> {
        // Parallel realisation of both sides.
        future::try_join(self.left.eval(interp), self.right.eval(interp)).boxed_local()
    }
}

impl<T: Clone + 'static> Build<T> {
    pub fn ret(value: T) -> Build<T> {
        Build(Rc::new(Node::Return(value)))
    }

    pub fn fail() -> Build<T> {
        Build(Rc::new(Node::Fail))
    }

    pub fn bind<U: Clone + 'static>(self, f: impl Fn(T) -> Build<U> + 'static) -> Build<U> {
        Build(Rc::new(Node::Compound(Box::new(BindNode {
            first: self,
            cont: Box::new(f),
        }))))
    }

    pub fn map<U: Clone + 'static>(self, f: impl Fn(T) -> U + 'static) -> Build<U> {
        Build(Rc::new(Node::Compound(Box::new(MapNode {
            first: self,
            f: Box::new(f),
        }))))
    }

    pub fn both<U: Clone + 'static>(self, other: Build<U>) -> Build<(T, U)> {
        Build(Rc::new(Node::Compound(Box::new(BothNode {
            left: self,
            right: other,
        }))))
    }

    /// Evaluate this arrow at most once per concrete build; later
    /// occurrences reuse the value. Re-entry during evaluation is a fatal
    /// cycle named after `name`.
    pub fn memo(self, name: impl Into<String>) -> Build<T> {
        Build(Rc::new(Node::Memo {
            name: name.into(),
            inner: self,
            state: RefCell::new(MemoState::Unevaluated),
        }))
    }

    pub(crate) fn eval<'a>(
        &'a self,
        interp: &'a dyn Interp,
    ) -> LocalBoxFuture<'a, Result<T, BuildError>> {
        match &*self.0 {
            Node::Return(v) => future::ready(Ok(v.clone())).boxed_local(),
            Node::Fail => future::ready(Err(BuildError::Fail)).boxed_local(),
            Node::Prim { prim, post } => async move {
                let value = eval_prim(prim, interp).await?;
                Ok(post(value))
            }
            .boxed_local(),
            Node::Compound(node) => node.eval(interp),
            Node::Memo { name, inner, state } => async move {
                eval_memo(name, inner, state, interp).await
            }
            .boxed_local(),
        }
    }
}

async fn eval_prim(prim: &Prim, interp: &dyn Interp) -> Result<PrimValue, BuildError> {
    match prim {
        Prim::Contents(p) => {
            interp.force_dep(p).await?;
            Ok(PrimValue::Text(interp.read_file(p)?))
        }
        Prim::LinesOf(p) => {
            interp.force_dep(p).await?;
            let text = interp.read_file(p)?;
            Ok(PrimValue::Lines(text.lines().map(str::to_owned).collect()))
        }
        Prim::Paths(ps) => {
            interp.defer_deps(ps);
            Ok(PrimValue::Unit)
        }
        Prim::Glob { dir, matching } => {
            Ok(PrimValue::PathSet(interp.glob_targets(dir, matching)))
        }
        Prim::FileExists(p) => Ok(PrimValue::Truth(interp.is_registered_target(p))),
        Prim::RecordLibDeps { dir, deps } => {
            interp.record_lib_deps(dir, deps);
            Ok(PrimValue::Unit)
        }
    }
}

async fn eval_memo<T: Clone + 'static>(
    name: &str,
    inner: &Build<T>,
    state: &RefCell<MemoState<T>>,
    interp: &dyn Interp,
) -> Result<T, BuildError> {
    // Shared-tree evaluation key; stable for the life of the node.
    let key = state as *const _ as usize;
    {
        let st = state.borrow();
        match &*st {
            MemoState::Evaluated(v) => return Ok(v.clone()),
            MemoState::Evaluating if interp.cache_memos() => {
                return Err(BuildError::MemoCycle(name.to_owned()));
            }
            _ => {}
        }
    }
    if interp.cache_memos() {
        *state.borrow_mut() = MemoState::Evaluating;
        let value = inner.eval(interp).await?;
        *state.borrow_mut() = MemoState::Evaluated(value.clone());
        Ok(value)
    } else {
        if !interp.enter_memo(key) {
            return Err(BuildError::MemoCycle(name.to_owned()));
        }
        let result = inner.eval(interp).await;
        interp.exit_memo(key);
        result
    }
}

/// The file's contents; names the file as a dependency.
pub fn contents(path: BuildPath) -> Build<String> {
    prim(Prim::Contents(path), |v| match v {
        PrimValue::Text(s) => s,
        _ => unreachable!("contents yields text"),
    })
}

/// The file's lines; names the file as a dependency.
pub fn lines_of(path: BuildPath) -> Build<Vec<String>> {
    prim(Prim::LinesOf(path), |v| match v {
        PrimValue::Lines(l) => l,
        _ => unreachable!("lines_of yields lines"),
    })
}

/// Declare dependencies without consuming their contents.
pub fn paths(paths: impl IntoIterator<Item = BuildPath>) -> Build<()> {
    prim(Prim::Paths(paths.into_iter().collect()), |_| ())
}

/// Registered targets in `dir` whose file name matches `matching`.
pub fn glob(dir: BuildPath, matching: Regex) -> Build<Vec<BuildPath>> {
    prim(Prim::Glob { dir, matching }, |v| match v {
        PrimValue::PathSet(ps) => ps,
        _ => unreachable!("glob yields paths"),
    })
}

/// True iff `path` is a registered target.
pub fn file_exists(path: BuildPath) -> Build<bool> {
    prim(Prim::FileExists(path), |v| match v {
        PrimValue::Truth(b) => b,
        _ => unreachable!("file_exists yields bool"),
    })
}

/// Side-channel observation of library requirements under `dir`; ignored
/// by the concrete executor, collected by closure analysis.
pub fn record_lib_deps(dir: BuildPath, deps: Vec<String>) -> Build<()> {
    prim(Prim::RecordLibDeps { dir, deps }, |_| ())
}

fn prim<T: Clone + 'static>(prim: Prim, post: impl Fn(PrimValue) -> T + 'static) -> Build<T> {
    Build(Rc::new(Node::Prim {
        prim,
        post: Box::new(post),
    }))
}
