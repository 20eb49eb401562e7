//! The build engine: resolves demanded files through the rule registry,
//! realises dependencies discovered during arrow evaluation, decides
//! staleness from the trace digest plus file timestamps, and executes
//! actions at most once per rule. Scheduling is cooperative and
//! single-threaded; rule bodies interleave only at await points.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use futures::future::{self, LocalBoxFuture};
use futures::FutureExt;
use regex::Regex;
use tracing::{debug, warn};

use crate::action::Action;
use crate::build::{self, Build, Interp};
use crate::db::{Trace, DB_PATH};
use crate::error::BuildError;
use crate::fs::TimestampCache;
use crate::hash::hash_rule;
use crate::path::{BuildPath, BUILD_DIR};
use crate::rules::{ExecStatus, PreRule, Registry, RuleThunk, SharedRule};
use crate::sandbox::Sandbox;

/// A build flavour with its own subtree under the build dir, and
/// optionally a local install dir whose contents the engine also owns.
#[derive(Debug, Clone)]
pub struct Context {
    pub name: String,
    pub build_dir: BuildPath,
    pub install_dir: Option<BuildPath>,
}

impl Context {
    pub fn new(name: impl Into<String>) -> Context {
        let name = name.into();
        let build_dir = BuildPath::local(BUILD_DIR).join(&name);
        Context {
            name,
            build_dir,
            install_dir: None,
        }
    }

    /// Declares a local install dir for this context; stale artifacts
    /// under it are garbage collected like the build dir's.
    pub fn with_install_dir(mut self, dir: BuildPath) -> Context {
        self.install_dir = Some(dir);
        self
    }
}

pub(crate) struct EngineInner {
    pub(crate) root: PathBuf,
    pub(crate) contexts: Vec<Context>,
    pub(crate) registry: RefCell<Registry>,
    pub(crate) trace: RefCell<Trace>,
    pub(crate) timestamps: RefCell<TimestampCache>,
    local_mkdirs: RefCell<HashSet<BuildPath>>,
    /// Built lazily on first glob/file-exists use; register rules first.
    targets_by_dir: RefCell<Option<Rc<BTreeMap<BuildPath, BTreeSet<BuildPath>>>>>,
    /// Targets whose producing action is in flight; unlinked on abnormal
    /// exit so half-written files never masquerade as up to date.
    pending_targets: RefCell<BTreeSet<BuildPath>>,
    gc_done: Cell<bool>,
}

/// The engine. Dropping it (or calling [`Engine::finish`]) unlinks any
/// pending targets and writes the trace back to `_build/.db`.
pub struct Engine {
    inner: Rc<EngineInner>,
    finished: bool,
}

impl Engine {
    pub fn new(root: impl Into<PathBuf>, contexts: Vec<Context>) -> anyhow::Result<Engine> {
        let root = root.into();
        let trace = Trace::load(&root.join(DB_PATH))?;
        Ok(Engine {
            inner: Rc::new(EngineInner {
                root,
                contexts,
                registry: RefCell::new(Registry::new()),
                trace: RefCell::new(trace),
                timestamps: RefCell::new(TimestampCache::new()),
                local_mkdirs: RefCell::new(HashSet::new()),
                targets_by_dir: RefCell::new(None),
                pending_targets: RefCell::new(BTreeSet::new()),
                gc_done: Cell::new(false),
            }),
            finished: false,
        })
    }

    pub fn contexts(&self) -> &[Context] {
        &self.inner.contexts
    }

    pub fn add_pre_rule(&self, pre: PreRule) -> Result<(), BuildError> {
        let rule = compile_rule(&self.inner, pre);
        self.inner.registry.borrow_mut().register(rule, false)
    }

    /// Like [`Engine::add_pre_rule`], but replaces any existing rule for
    /// the same targets in place.
    pub fn add_pre_rule_override(&self, pre: PreRule) -> Result<(), BuildError> {
        let rule = compile_rule(&self.inner, pre);
        self.inner.registry.borrow_mut().register(rule, true)
    }

    /// For each context, synthesises `copy source -> build_dir/source`
    /// rules for every source file whose build path is not already a
    /// target, so user rules win. The copy rules themselves register with
    /// override so a later generator may replace them.
    pub fn add_source_copy_rules(&self, sources: &[BuildPath]) -> Result<(), BuildError> {
        for src in sources {
            if !src.is_local() || src.is_in_build_dir() {
                continue;
            }
            for ctx in &self.inner.contexts {
                let dst = ctx.build_dir.join(src.as_path());
                if self.inner.registry.borrow().is_target(&dst) {
                    continue;
                }
                let (s, d) = (src.clone(), dst.clone());
                let copy = build::paths([src.clone()]).map(move |_| Action::Copy {
                    src: s.clone(),
                    dst: d.clone(),
                });
                let rule = compile_rule(&self.inner, PreRule::new(copy, [dst]));
                self.inner.registry.borrow_mut().register(rule, true)?;
            }
        }
        Ok(())
    }

    pub fn is_target(&self, path: &BuildPath) -> bool {
        self.inner.registry.borrow().is_target(path)
    }

    pub fn all_targets(&self) -> Vec<BuildPath> {
        self.inner
            .registry
            .borrow()
            .all_targets()
            .cloned()
            .collect()
    }

    /// Brings every requested target up to date.
    pub fn do_build(&self, targets: &[BuildPath]) -> LocalBoxFuture<'static, Result<(), BuildError>> {
        let inner = self.inner.clone();
        let targets = targets.to_vec();
        async move {
            if !inner.gc_done.get() {
                inner.gc_done.set(true);
                remove_old_artifacts(&inner)?;
            }
            let waits: Vec<_> = targets
                .iter()
                .map(|t| wait_for_file(&inner, t, t))
                .collect();
            future::try_join_all(waits).await?;
            Ok(())
        }
        .boxed_local()
    }

    /// Drives [`Engine::do_build`] to completion on the current thread.
    pub fn do_build_blocking(&self, targets: &[BuildPath]) -> Result<(), BuildError> {
        futures::executor::block_on(self.do_build(targets))
    }

    /// Deletes everything under each context's build dir that no rule
    /// produces, so stale artifacts from previous rule sets are never
    /// mistaken for inputs. Runs automatically before an engine's first
    /// build.
    pub fn remove_old_artifacts(&self) -> Result<(), BuildError> {
        remove_old_artifacts(&self.inner)
    }

    /// Library requirements over the approximate closure of `targets`,
    /// per directory that recorded them.
    pub fn all_lib_deps(
        &self,
        targets: &[BuildPath],
    ) -> Result<BTreeMap<BuildPath, BTreeSet<String>>, BuildError> {
        crate::closure::all_lib_deps(&self.inner, targets)
    }

    /// Same, grouped by context (first build-dir segment of the
    /// recording directory).
    pub fn all_lib_deps_by_context(
        &self,
        targets: &[BuildPath],
    ) -> Result<BTreeMap<String, BTreeSet<String>>, BuildError> {
        crate::closure::all_lib_deps_by_context(&self.inner, targets)
    }

    /// Finalises the engine: unlinks pending targets and writes the
    /// trace. Dropping without calling this performs the same cleanup,
    /// logging any trouble instead of reporting it.
    pub fn finish(mut self) -> anyhow::Result<()> {
        self.finished = true;
        finalize(&self.inner)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(err) = finalize(&self.inner) {
                warn!("build engine cleanup failed: {err:#}");
            }
        }
    }
}

fn finalize(inner: &EngineInner) -> anyhow::Result<()> {
    let pending = std::mem::take(&mut *inner.pending_targets.borrow_mut());
    for target in &pending {
        debug!(path = %target, "unlinking pending target");
        match std::fs::remove_file(target.resolve(&inner.root)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => anyhow::bail!("unlink pending target {}: {}", target, err),
        }
    }
    // The trace is only worth writing if a build tree exists at all.
    if inner.root.join(BUILD_DIR).is_dir() {
        inner.trace.borrow().dump(&inner.root.join(DB_PATH))?;
    }
    Ok(())
}

/// Returns a future realising `file`, deduplicated per rule. `targeting`
/// is the file whose realisation demanded `file`; the chain of these
/// links is what cycle reports and error annotations walk.
pub(crate) fn wait_for_file(
    inner: &Rc<EngineInner>,
    file: &BuildPath,
    targeting: &BuildPath,
) -> LocalBoxFuture<'static, Result<(), BuildError>> {
    let rule = inner.registry.borrow().find(file);
    let Some(rule) = rule else {
        // Not a registered target: inside the build tree that is fatal,
        // outside it the file is a source and only has to exist.
        if file.is_in_build_dir() {
            return ready_err(BuildError::NoRule(file.clone()));
        }
        let known = inner
            .timestamps
            .borrow_mut()
            .timestamp(&inner.root, file)
            .is_some();
        return if known {
            future::ready(Ok(())).boxed_local()
        } else {
            ready_err(BuildError::FileUnavailable(file.clone()))
        };
    };

    enum Dispatch {
        Start(RuleThunk),
        Wait(crate::rules::BuildFuture),
        InProgress,
    }

    let dispatch = {
        let mut r = rule.borrow_mut();
        match r.exec {
            ExecStatus::Running { ref future, .. } => Dispatch::Wait(future.clone()),
            ExecStatus::Starting { .. } => Dispatch::InProgress,
            ExecStatus::NotStarted(_) => {
                let taken = std::mem::replace(
                    &mut r.exec,
                    ExecStatus::Starting {
                        for_file: targeting.clone(),
                    },
                );
                match taken {
                    ExecStatus::NotStarted(thunk) => Dispatch::Start(thunk),
                    _ => unreachable!("exec state changed under us"),
                }
            }
        }
    };

    match dispatch {
        Dispatch::Wait(fut) => fut.boxed_local(),
        Dispatch::InProgress => {
            // The rule is mid-start somewhere up the demand chain: a
            // dependency cycle.
            ready_err(BuildError::Cycle(assemble_cycle(inner, file, targeting)))
        }
        Dispatch::Start(thunk) => start_rule(inner, &rule, thunk, file, targeting),
    }
}

fn ready_err(err: BuildError) -> LocalBoxFuture<'static, Result<(), BuildError>> {
    future::ready(Err(err)).boxed_local()
}

fn start_rule(
    inner: &Rc<EngineInner>,
    rule: &SharedRule,
    thunk: RuleThunk,
    file: &BuildPath,
    targeting: &BuildPath,
) -> LocalBoxFuture<'static, Result<(), BuildError>> {
    debug!(file = %file, "starting rule");
    let raw = thunk(file.clone());
    let weak = Rc::downgrade(inner);
    let faulting = file.clone();
    let shared = async move {
        match raw.await {
            Ok(()) => Ok(()),
            Err(err) => Err(annotate_error(&weak, &faulting, err)),
        }
    }
    .boxed_local()
    .shared();

    // Rust futures are lazy; poll once while the rule is still Starting so
    // the body runs to its first suspension point, as the cooperative
    // model requires. Recursive demands made during this poll observe the
    // Starting state, which is what makes cycle detection terminate.
    {
        let mut probe = shared.clone();
        let waker = futures::task::noop_waker();
        let mut cx = std::task::Context::from_waker(&waker);
        let _ = probe.poll_unpin(&mut cx);
    }

    rule.borrow_mut().exec = ExecStatus::Running {
        for_file: targeting.clone(),
        future: shared.clone(),
    };
    shared.boxed_local()
}

/// Wraps a rule-local failure with the chain of files that demanded the
/// faulting rule and the stack at the point of wrapping. Already-annotated
/// errors pass through verbatim.
fn annotate_error(weak: &Weak<EngineInner>, file: &BuildPath, err: BuildError) -> BuildError {
    if matches!(err, BuildError::Rule { .. }) {
        return err;
    }
    let backtrace = std::backtrace::Backtrace::capture();
    let dep_path = match weak.upgrade() {
        Some(inner) => demand_chain(&inner, file),
        None => vec![file.clone()],
    };
    BuildError::Rule {
        dep_path,
        cause: std::sync::Arc::new(err),
        backtrace: std::sync::Arc::new(backtrace),
    }
}

/// The chain of files from `file` back to the user-requested root, via
/// the `for_file` links of in-flight rules.
fn demand_chain(inner: &EngineInner, file: &BuildPath) -> Vec<BuildPath> {
    let registry = inner.registry.borrow();
    let mut chain = vec![file.clone()];
    let mut seen: HashSet<BuildPath> = HashSet::new();
    let mut cur = file.clone();
    loop {
        if !seen.insert(cur.clone()) {
            break;
        }
        let next = registry
            .find(&cur)
            .and_then(|r| r.borrow().exec.for_file().cloned());
        match next {
            Some(ff) if ff != cur => {
                chain.push(ff.clone());
                cur = ff;
            }
            _ => break,
        }
    }
    chain
}

/// Ordered cycle `file -> ... -> file`, reconstructed by walking
/// `for_file` links from the demanding side back to `file`.
fn assemble_cycle(inner: &Rc<EngineInner>, file: &BuildPath, targeting: &BuildPath) -> Vec<BuildPath> {
    let registry = inner.registry.borrow();
    let mut cycle = vec![file.clone()];
    let mut seen: HashSet<BuildPath> = HashSet::new();
    let mut cur = targeting.clone();
    while cur != *file && seen.insert(cur.clone()) {
        cycle.push(cur.clone());
        cur = registry
            .find(&cur)
            .and_then(|r| r.borrow().exec.for_file().cloned())
            .unwrap_or_else(|| file.clone());
    }
    cycle.push(file.clone());
    cycle
}

/// Compiles a pre-rule into a shared rule whose thunk runs the body
/// below when a target is first demanded. The thunk captures a weak
/// engine handle so the registry does not keep itself alive through its
/// own closures.
pub(crate) fn compile_rule(inner: &Rc<EngineInner>, pre: PreRule) -> SharedRule {
    let PreRule {
        build,
        targets,
        sandbox,
    } = pre;
    let weak = Rc::downgrade(inner);
    let thunk_build = build.clone();
    let thunk_targets = targets.clone();
    let thunk: RuleThunk = Box::new(move |for_file: BuildPath| {
        run_rule(weak, thunk_build, thunk_targets, sandbox, for_file).boxed_local()
    });
    Rc::new(RefCell::new(crate::rules::Rule {
        targets,
        build,
        sandbox,
        exec: ExecStatus::NotStarted(thunk),
    }))
}

async fn run_rule(
    weak: Weak<EngineInner>,
    build: Build<Action>,
    targets: BTreeSet<BuildPath>,
    sandbox: bool,
    for_file: BuildPath,
) -> Result<(), BuildError> {
    let inner = weak
        .upgrade()
        .ok_or_else(|| BuildError::Internal("engine dropped with rules in flight".into()))?;

    for target in &targets {
        ensure_parent_dir(&inner, target)?;
    }

    // Realise dependencies while computing the concrete action.
    let interp = ConcreteInterp::new(inner.clone(), for_file.clone());
    let action = build.eval(&interp).await?;
    let deps = interp.finish().await?;

    let digest = hash_rule(&deps, &targets, &action);
    let rule_changed = {
        let mut trace = inner.trace.borrow_mut();
        let mut changed = false;
        for target in &targets {
            changed |= trace.get(target) != Some(&digest);
            trace.set(target.clone(), digest.clone());
        }
        changed
    };

    let (deps_max_ts, targets_min_ts) = {
        let mut ts = inner.timestamps.borrow_mut();
        (
            ts.max_timestamp(&inner.root, &deps),
            ts.min_timestamp(&inner.root, &targets),
        )
    };
    if deps_max_ts.missing_files {
        return Err(BuildError::Internal(format!(
            "dependencies of {} missing after waiting for them",
            for_file
        )));
    }

    let must_run = rule_changed
        || targets_min_ts.missing_files
        || match (deps_max_ts.limit, targets_min_ts.limit) {
            (None, _) => {
                warn!(file = %for_file, "rule has no dependencies, rebuilding unconditionally");
                true
            }
            (Some(newest_dep), Some(oldest_target)) => oldest_target < newest_dep,
            (Some(_), None) => false,
        };

    if !must_run {
        debug!(file = %for_file, "up to date");
        return Ok(());
    }

    // Targets the action does not update in place are removed up front
    // and tracked so abnormal exit cleans half-written files.
    let updated = action.updated_files();
    for target in &targets {
        if updated.contains(target) {
            continue;
        }
        unlink(&inner, target)?;
        inner.pending_targets.borrow_mut().insert(target.clone());
    }

    let (exec_action, sandbox_dir) = if sandbox {
        let sb = Sandbox::create(&inner.root, &digest, &deps, &targets, &updated)?;
        let mapped = action.sandboxed(&|p| sb.map_path(p));
        (mapped, Some(sb))
    } else {
        (action, None)
    };

    if let Some(dir) = exec_action.dir() {
        ensure_dir(&inner, dir)?;
    }
    debug!(file = %for_file, "running action");
    exec_action.exec(&inner.root).await?;

    if let Some(sb) = sandbox_dir {
        sb.export_targets(&targets)?;
        sb.remove();
    }
    {
        let mut pending = inner.pending_targets.borrow_mut();
        for target in &targets {
            pending.remove(target);
        }
    }

    let missing: Vec<BuildPath> = {
        let mut ts = inner.timestamps.borrow_mut();
        targets
            .iter()
            .filter(|t| ts.restat(&inner.root, t).is_none())
            .cloned()
            .collect()
    };
    if !missing.is_empty() {
        return Err(BuildError::TargetsMissing(missing));
    }
    Ok(())
}

/// The concrete arrow interpreter: registers dependencies and realises
/// them through the scheduler.
struct ConcreteInterp {
    inner: Rc<EngineInner>,
    targeting: BuildPath,
    deps: RefCell<BTreeSet<BuildPath>>,
    wait_for_deps: RefCell<Vec<LocalBoxFuture<'static, Result<(), BuildError>>>>,
}

impl ConcreteInterp {
    fn new(inner: Rc<EngineInner>, targeting: BuildPath) -> ConcreteInterp {
        ConcreteInterp {
            inner,
            targeting,
            deps: RefCell::new(BTreeSet::new()),
            wait_for_deps: RefCell::new(Vec::new()),
        }
    }

    /// Awaits the aggregate of all deferred dependency realisations and
    /// yields the realised dependency set.
    async fn finish(self) -> Result<BTreeSet<BuildPath>, BuildError> {
        let pending: Vec<_> = self.wait_for_deps.borrow_mut().drain(..).collect();
        future::try_join_all(pending).await?;
        Ok(self.deps.into_inner())
    }
}

impl Interp for ConcreteInterp {
    fn force_dep<'a>(
        &'a self,
        path: &'a BuildPath,
    ) -> LocalBoxFuture<'a, Result<(), BuildError>> {
        self.deps.borrow_mut().insert(path.clone());
        wait_for_file(&self.inner, path, &self.targeting)
    }

    fn defer_deps(&self, paths: &BTreeSet<BuildPath>) {
        for path in paths {
            let fresh = self.deps.borrow_mut().insert(path.clone());
            if fresh {
                // Creating the future may recursively start the dep's
                // rule; no cell borrows may be held here.
                let wait = wait_for_file(&self.inner, path, &self.targeting);
                self.wait_for_deps.borrow_mut().push(wait);
            }
        }
    }

    fn read_file(&self, path: &BuildPath) -> Result<String, BuildError> {
        std::fs::read_to_string(path.resolve(&self.inner.root))
            .map_err(|err| BuildError::io(path, err))
    }

    fn glob_targets(&self, dir: &BuildPath, matching: &Regex) -> Vec<BuildPath> {
        glob_registered(&self.inner, dir, matching)
    }

    fn is_registered_target(&self, path: &BuildPath) -> bool {
        self.inner.registry.borrow().is_target(path)
    }

    fn record_lib_deps(&self, _dir: &BuildPath, _deps: &[String]) {
        // Observed by closure analysis only; the executor ignores it.
    }

    fn cache_memos(&self) -> bool {
        true
    }
}

/// The per-directory target index, built on first use. Rules registered
/// afterwards are not visible to globs.
pub(crate) fn targets_by_dir_index(
    inner: &EngineInner,
) -> Rc<BTreeMap<BuildPath, BTreeSet<BuildPath>>> {
    let mut cached = inner.targets_by_dir.borrow_mut();
    if let Some(index) = &*cached {
        return index.clone();
    }
    let index = Rc::new(inner.registry.borrow().targets_by_dir());
    *cached = Some(index.clone());
    index
}

pub(crate) fn glob_registered(
    inner: &EngineInner,
    dir: &BuildPath,
    matching: &Regex,
) -> Vec<BuildPath> {
    let index = targets_by_dir_index(inner);
    let Some(targets) = index.get(dir) else {
        return Vec::new();
    };
    targets
        .iter()
        .filter(|t| {
            t.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| matching.is_match(n))
        })
        .cloned()
        .collect()
}

fn ensure_dir(inner: &EngineInner, dir: &BuildPath) -> Result<(), BuildError> {
    if !dir.is_local() {
        return Ok(());
    }
    if inner.local_mkdirs.borrow().contains(dir) {
        return Ok(());
    }
    std::fs::create_dir_all(dir.resolve(&inner.root)).map_err(|err| BuildError::io(dir, err))?;
    inner.local_mkdirs.borrow_mut().insert(dir.clone());
    Ok(())
}

fn ensure_parent_dir(inner: &EngineInner, path: &BuildPath) -> Result<(), BuildError> {
    match path.parent() {
        Some(parent) => ensure_dir(inner, &parent),
        None => Ok(()),
    }
}

fn unlink(inner: &EngineInner, path: &BuildPath) -> Result<(), BuildError> {
    match std::fs::remove_file(path.resolve(&inner.root)) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(BuildError::io(path, err)),
    }
}

fn remove_old_artifacts(inner: &EngineInner) -> Result<(), BuildError> {
    let registry = inner.registry.borrow();
    for ctx in &inner.contexts {
        let dirs = std::iter::once(&ctx.build_dir).chain(ctx.install_dir.as_ref());
        for dir in dirs {
            if !dir.resolve(&inner.root).is_dir() {
                continue;
            }
            gc_dir(&registry, &inner.root, dir).map_err(|err| BuildError::io(dir, err))?;
        }
    }
    Ok(())
}

/// Removes non-target files under `dir`, recursively; returns true when
/// the directory ended up empty.
fn gc_dir(registry: &Registry, root: &Path, dir: &BuildPath) -> std::io::Result<bool> {
    let mut kept = 0usize;
    for entry in std::fs::read_dir(dir.resolve(root))? {
        let entry = entry?;
        let rel = dir.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            if gc_dir(registry, root, &rel)? {
                let _ = std::fs::remove_dir(entry.path());
            } else {
                kept += 1;
            }
        } else if registry.is_target(&rel) {
            kept += 1;
        } else {
            debug!(path = %rel, "removing stale artifact");
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(kept == 0)
}
