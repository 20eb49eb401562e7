//! Rules bind target paths to the build description that produces them.
//! A pre-rule is what callers declare; compiling it attaches mutable
//! execution state. One rule instance is shared under every target it
//! produces, so an exec transition is observed through every alias.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::rc::Rc;

use futures::future::{LocalBoxFuture, Shared};

use crate::action::Action;
use crate::build::Build;
use crate::error::BuildError;
use crate::path::BuildPath;

/// A declared rule: how to produce `targets`, and whether the action
/// should run inside a private sandbox directory.
pub struct PreRule {
    pub build: Build<Action>,
    pub targets: BTreeSet<BuildPath>,
    pub sandbox: bool,
}

impl PreRule {
    pub fn new(build: Build<Action>, targets: impl IntoIterator<Item = BuildPath>) -> PreRule {
        PreRule {
            build,
            targets: targets.into_iter().collect(),
            sandbox: false,
        }
    }

    pub fn sandboxed(mut self) -> PreRule {
        self.sandbox = true;
        self
    }
}

/// The result every waiter on a rule receives.
pub(crate) type BuildFuture = Shared<LocalBoxFuture<'static, Result<(), BuildError>>>;

/// The rule body, invoked when a target is first demanded. The argument
/// is the target file whose demand started the rule.
pub(crate) type RuleThunk =
    Box<dyn FnOnce(BuildPath) -> LocalBoxFuture<'static, Result<(), BuildError>>>;

/// Per-rule execution state. `for_file` records which file's realisation
/// claimed the rule; cycle reporting walks these links.
pub(crate) enum ExecStatus {
    NotStarted(RuleThunk),
    Starting {
        for_file: BuildPath,
    },
    Running {
        for_file: BuildPath,
        future: BuildFuture,
    },
}

impl ExecStatus {
    pub(crate) fn for_file(&self) -> Option<&BuildPath> {
        match self {
            ExecStatus::NotStarted(_) => None,
            ExecStatus::Starting { for_file } | ExecStatus::Running { for_file, .. } => {
                Some(for_file)
            }
        }
    }
}

pub(crate) struct Rule {
    pub targets: BTreeSet<BuildPath>,
    pub build: Build<Action>,
    pub sandbox: bool,
    pub exec: ExecStatus,
}

/// Shared so that every target alias sees the same execution state.
pub(crate) type SharedRule = Rc<RefCell<Rule>>;

/// Target path -> the rule that produces it.
#[derive(Default)]
pub(crate) struct Registry {
    files: HashMap<BuildPath, SharedRule>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    pub fn add_rule(
        &mut self,
        path: BuildPath,
        rule: SharedRule,
        allow_override: bool,
    ) -> Result<(), BuildError> {
        if self.files.contains_key(&path) && !allow_override {
            return Err(BuildError::MultipleRules(path));
        }
        self.files.insert(path, rule);
        Ok(())
    }

    /// Registers a rule under every one of its targets.
    pub fn register(&mut self, rule: SharedRule, allow_override: bool) -> Result<(), BuildError> {
        let targets = rule.borrow().targets.clone();
        for target in targets {
            self.add_rule(target, rule.clone(), allow_override)?;
        }
        Ok(())
    }

    pub fn is_target(&self, path: &BuildPath) -> bool {
        self.files.contains_key(path)
    }

    pub fn find(&self, path: &BuildPath) -> Option<SharedRule> {
        self.files.get(path).cloned()
    }

    pub fn all_targets(&self) -> impl Iterator<Item = &BuildPath> {
        self.files.keys()
    }

    /// Index of registered targets grouped by parent directory, for glob
    /// and file-exists queries.
    pub fn targets_by_dir(&self) -> BTreeMap<BuildPath, BTreeSet<BuildPath>> {
        let mut by_dir: BTreeMap<BuildPath, BTreeSet<BuildPath>> = BTreeMap::new();
        for target in self.files.keys() {
            if let Some(dir) = target.parent() {
                by_dir.entry(dir).or_default().insert(target.clone());
            }
        }
        by_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build;

    fn dummy_rule(targets: &[&str]) -> SharedRule {
        let action = Action::WriteFile {
            path: BuildPath::local(targets[0]),
            contents: String::new(),
        };
        Rc::new(RefCell::new(Rule {
            targets: targets.iter().map(BuildPath::local).collect(),
            build: build::paths([]).map(move |_| action.clone()),
            sandbox: false,
            exec: ExecStatus::NotStarted(Box::new(|_| {
                Box::pin(futures::future::ready(Ok(())))
            })),
        }))
    }

    #[test]
    fn duplicate_target_is_fatal() {
        let mut registry = Registry::new();
        registry.register(dummy_rule(&["a"]), false).unwrap();
        let err = registry.register(dummy_rule(&["a"]), false).unwrap_err();
        assert!(matches!(err, BuildError::MultipleRules(p) if p == BuildPath::local("a")));
    }

    #[test]
    fn override_replaces_in_place() {
        let mut registry = Registry::new();
        registry.register(dummy_rule(&["a"]), false).unwrap();
        let winner = dummy_rule(&["a"]);
        registry.register(winner.clone(), true).unwrap();
        assert!(Rc::ptr_eq(&registry.find(&BuildPath::local("a")).unwrap(), &winner));
    }

    #[test]
    fn aliases_share_one_rule_instance() {
        let mut registry = Registry::new();
        registry.register(dummy_rule(&["a", "b"]), false).unwrap();
        let via_a = registry.find(&BuildPath::local("a")).unwrap();
        let via_b = registry.find(&BuildPath::local("b")).unwrap();
        assert!(Rc::ptr_eq(&via_a, &via_b));

        // An exec transition is visible through every alias.
        via_a.borrow_mut().exec = ExecStatus::Starting {
            for_file: BuildPath::local("a"),
        };
        assert_eq!(
            via_b.borrow().exec.for_file(),
            Some(&BuildPath::local("a"))
        );
    }

    #[test]
    fn targets_by_dir_groups_by_parent() {
        let mut registry = Registry::new();
        registry
            .register(dummy_rule(&["out/a.o", "out/b.o", "c.o"]), false)
            .unwrap();
        let by_dir = registry.targets_by_dir();
        assert_eq!(by_dir.get(&BuildPath::local("out")).unwrap().len(), 2);
        // Bare-name targets have no parent entry.
        assert_eq!(by_dir.len(), 1);
    }
}
