//! Approximate rule analysis: evaluates build arrows without executing
//! anything to predict each rule's dependencies, computes the closure of
//! rules reachable from requested targets (reporting cycles at this level
//! too), and aggregates recorded library requirements.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Component;
use std::rc::Rc;

use futures::future::{self, LocalBoxFuture};
use futures::FutureExt;
use regex::Regex;

use crate::build::Interp;
use crate::error::BuildError;
use crate::path::BuildPath;
use crate::rules::SharedRule;
use crate::work::{glob_registered, EngineInner};

/// What approximate evaluation learns about one rule.
pub(crate) struct RuleApprox {
    pub deps: BTreeSet<BuildPath>,
    pub lib_deps: Vec<(BuildPath, BTreeSet<String>)>,
}

/// The approximate interpreter: collects declared dependencies and
/// lib-dep observations, substituting placeholder contents so nothing
/// is built or read.
struct ApproxInterp {
    inner: Rc<EngineInner>,
    deps: RefCell<BTreeSet<BuildPath>>,
    lib_deps: RefCell<Vec<(BuildPath, BTreeSet<String>)>>,
    visiting_memos: RefCell<HashSet<usize>>,
}

impl Interp for ApproxInterp {
    fn force_dep<'a>(
        &'a self,
        path: &'a BuildPath,
    ) -> LocalBoxFuture<'a, Result<(), BuildError>> {
        self.deps.borrow_mut().insert(path.clone());
        future::ready(Ok(())).boxed_local()
    }

    fn defer_deps(&self, paths: &BTreeSet<BuildPath>) {
        self.deps.borrow_mut().extend(paths.iter().cloned());
    }

    fn read_file(&self, _path: &BuildPath) -> Result<String, BuildError> {
        // Conservative placeholder; the dependency is already recorded.
        Ok(String::new())
    }

    fn glob_targets(&self, dir: &BuildPath, matching: &Regex) -> Vec<BuildPath> {
        glob_registered(&self.inner, dir, matching)
    }

    fn is_registered_target(&self, path: &BuildPath) -> bool {
        self.inner.registry.borrow().is_target(path)
    }

    fn record_lib_deps(&self, dir: &BuildPath, deps: &[String]) {
        self.lib_deps
            .borrow_mut()
            .push((dir.clone(), deps.iter().cloned().collect()));
    }

    fn cache_memos(&self) -> bool {
        false
    }

    fn enter_memo(&self, key: usize) -> bool {
        self.visiting_memos.borrow_mut().insert(key)
    }

    fn exit_memo(&self, key: usize) {
        self.visiting_memos.borrow_mut().remove(&key);
    }
}

pub(crate) fn approx_rule(
    inner: &Rc<EngineInner>,
    rule: &SharedRule,
) -> Result<RuleApprox, BuildError> {
    let interp = ApproxInterp {
        inner: inner.clone(),
        deps: RefCell::new(BTreeSet::new()),
        lib_deps: RefCell::new(Vec::new()),
        visiting_memos: RefCell::new(HashSet::new()),
    };
    let build = rule.borrow().build.clone();
    // Approximate evaluation never suspends: dependencies resolve
    // immediately and file reads are placeholders.
    match build.eval(&interp).now_or_never() {
        Some(result) => {
            result?;
        }
        None => {
            return Err(BuildError::Internal(
                "approximate evaluation suspended".into(),
            ));
        }
    }
    Ok(RuleApprox {
        deps: interp.deps.into_inner(),
        lib_deps: interp.lib_deps.into_inner(),
    })
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    InProgress,
    Done,
}

struct ClosureWalk<'e> {
    inner: &'e Rc<EngineInner>,
    state: HashMap<*const (), Visit>,
    stack: Vec<BuildPath>,
    /// Rules in dependency-first order, with their approximation.
    out: Vec<(SharedRule, RuleApprox)>,
}

impl<'e> ClosureWalk<'e> {
    fn visit(&mut self, target: &BuildPath) -> Result<(), BuildError> {
        let Some(rule) = self.inner.registry.borrow().find(target) else {
            // Source files are leaves of the closure.
            return Ok(());
        };
        let key = Rc::as_ptr(&rule) as *const ();
        match self.state.get(&key) {
            Some(Visit::Done) => return Ok(()),
            Some(Visit::InProgress) => {
                let mut cycle: Vec<BuildPath> = match self
                    .stack
                    .iter()
                    .position(|f| f == target)
                {
                    Some(start) => self.stack[start..].to_vec(),
                    None => self.stack.clone(),
                };
                cycle.push(target.clone());
                return Err(BuildError::Cycle(cycle));
            }
            None => {}
        }

        self.state.insert(key, Visit::InProgress);
        self.stack.push(target.clone());
        let approx = approx_rule(self.inner, &rule)?;
        for dep in &approx.deps {
            self.visit(dep)?;
        }
        self.stack.pop();
        self.state.insert(key, Visit::Done);
        self.out.push((rule, approx));
        Ok(())
    }
}

/// Rules reachable from `targets` through approximate dependencies, in
/// dependency-first order.
pub(crate) fn rule_closure(
    inner: &Rc<EngineInner>,
    targets: &[BuildPath],
) -> Result<Vec<(SharedRule, RuleApprox)>, BuildError> {
    let mut walk = ClosureWalk {
        inner,
        state: HashMap::new(),
        stack: Vec::new(),
        out: Vec::new(),
    };
    for target in targets {
        walk.visit(target)?;
    }
    Ok(walk.out)
}

/// Library requirements over the closure, keyed by the directory that
/// recorded them.
pub(crate) fn all_lib_deps(
    inner: &Rc<EngineInner>,
    targets: &[BuildPath],
) -> Result<BTreeMap<BuildPath, BTreeSet<String>>, BuildError> {
    let mut merged: BTreeMap<BuildPath, BTreeSet<String>> = BTreeMap::new();
    for (_, approx) in rule_closure(inner, targets)? {
        for (dir, libs) in approx.lib_deps {
            merged.entry(dir).or_default().extend(libs);
        }
    }
    Ok(merged)
}

/// The context a build-dir path belongs to: the path segment directly
/// under the build dir.
fn context_of(dir: &BuildPath) -> Option<String> {
    if !dir.is_in_build_dir() {
        return None;
    }
    match dir.as_path().components().nth(1) {
        Some(Component::Normal(name)) => name.to_str().map(str::to_owned),
        _ => None,
    }
}

/// Library requirements over the closure, grouped by context.
pub(crate) fn all_lib_deps_by_context(
    inner: &Rc<EngineInner>,
    targets: &[BuildPath],
) -> Result<BTreeMap<String, BTreeSet<String>>, BuildError> {
    let mut merged: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (dir, libs) in all_lib_deps(inner, targets)? {
        if let Some(ctx) = context_of(&dir) {
            merged.entry(ctx).or_default().extend(libs);
        }
    }
    Ok(merged)
}
