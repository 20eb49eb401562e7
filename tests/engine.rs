//! End-to-end build scenarios, driving the engine against a temporary
//! workspace. Each phase uses a fresh engine so the trace round-trips
//! through `_build/.db` the way separate invocations would.

use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

use mortar::build;
use mortar::{Action, BuildError, BuildPath, Context, Engine, PreRule};

/// Manages a temporary workspace for driving builds.
struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    fn new() -> anyhow::Result<TestSpace> {
        Ok(TestSpace {
            dir: tempfile::tempdir()?,
        })
    }

    fn engine(&self) -> anyhow::Result<Engine> {
        Engine::new(self.dir.path(), vec![Context::new("default")])
    }

    fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(self.dir.path().join(path), content)
    }

    fn read(&self, path: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.dir.path().join(path))
    }

    fn exists(&self, path: &str) -> bool {
        self.dir.path().join(path).exists()
    }

    fn mtime(&self, path: &str) -> SystemTime {
        std::fs::metadata(self.dir.path().join(path))
            .unwrap()
            .modified()
            .unwrap()
    }

    /// Pushes a file's mtime into the past, so freshness comparisons do
    /// not depend on filesystem timestamp granularity.
    fn age(&self, path: &str, secs: u64) {
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(self.dir.path().join(path))
            .unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(secs))
            .unwrap();
    }
}

fn p(path: &str) -> BuildPath {
    BuildPath::local(path)
}

/// `copy src -> dst` with `src` declared as the dependency.
fn copy_rule(src: &str, dst: &str) -> PreRule {
    let (s, d) = (p(src), p(dst));
    let build = build::paths([s.clone()]).map(move |_| Action::Copy {
        src: s.clone(),
        dst: d.clone(),
    });
    PreRule::new(build, [p(dst)])
}

/// Writes fixed contents to `target`, depending on `dep`.
fn write_rule(dep: &str, target: &str, contents: &str) -> PreRule {
    let (t, c) = (p(target), contents.to_owned());
    let build = build::paths([p(dep)]).map(move |_| Action::WriteFile {
        path: t.clone(),
        contents: c.clone(),
    });
    PreRule::new(build, [p(target)])
}

#[test]
fn basic_rebuild() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.txt", "contents")?;
    let out = "_build/default/b.txt";

    // First build runs the action.
    let engine = space.engine()?;
    engine.add_pre_rule(copy_rule("a.txt", out))?;
    engine.do_build_blocking(&[p(out)])?;
    engine.finish()?;
    assert_eq!(space.read(out)?, "contents");
    let built = space.mtime(out);

    // Unchanged inputs: the second build does nothing.
    let engine = space.engine()?;
    engine.add_pre_rule(copy_rule("a.txt", out))?;
    engine.do_build_blocking(&[p(out)])?;
    engine.finish()?;
    assert_eq!(space.mtime(out), built);

    // A dependency newer than the target triggers a rerun.
    space.age(out, 1000);
    let aged = space.mtime(out);
    let engine = space.engine()?;
    engine.add_pre_rule(copy_rule("a.txt", out))?;
    engine.do_build_blocking(&[p(out)])?;
    engine.finish()?;
    assert_ne!(space.mtime(out), aged);

    // A deleted target is rebuilt.
    std::fs::remove_file(space.dir.path().join(out))?;
    let engine = space.engine()?;
    engine.add_pre_rule(copy_rule("a.txt", out))?;
    engine.do_build_blocking(&[p(out)])?;
    engine.finish()?;
    assert_eq!(space.read(out)?, "contents");
    Ok(())
}

#[test]
fn changed_action_reruns_despite_fresh_timestamps() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.txt", "x")?;
    let out = "_build/default/gen.txt";

    let engine = space.engine()?;
    engine.add_pre_rule(write_rule("a.txt", out, "v1"))?;
    engine.do_build_blocking(&[p(out)])?;
    engine.finish()?;
    assert_eq!(space.read(out)?, "v1");

    // Same deps and targets, different action: the digest changes, so the
    // rule reruns even though the target is newer than its dependency.
    let engine = space.engine()?;
    engine.add_pre_rule(write_rule("a.txt", out, "v2"))?;
    engine.do_build_blocking(&[p(out)])?;
    engine.finish()?;
    assert_eq!(space.read(out)?, "v2");
    Ok(())
}

#[test]
fn dependencies_discovered_from_file_contents() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("list.txt", "inner.txt")?;
    space.write("inner.txt", "payload-1")?;
    let out = "_build/default/out.txt";

    // The rule reads list.txt to learn which file to depend on, then
    // bakes that file's contents into its action.
    let make_rule = || {
        let target = p(out);
        let build = build::contents(p("list.txt")).bind(move |name| {
            let target = target.clone();
            build::contents(p(name.trim())).map(move |text| Action::WriteFile {
                path: target.clone(),
                contents: text,
            })
        });
        PreRule::new(build, [p(out)])
    };

    let engine = space.engine()?;
    engine.add_pre_rule(make_rule())?;
    engine.do_build_blocking(&[p(out)])?;
    engine.finish()?;
    assert_eq!(space.read(out)?, "payload-1");

    // Changing the dynamically discovered dependency changes the action,
    // so the rule reruns.
    space.write("inner.txt", "payload-2")?;
    let engine = space.engine()?;
    engine.add_pre_rule(make_rule())?;
    engine.do_build_blocking(&[p(out)])?;
    engine.finish()?;
    assert_eq!(space.read(out)?, "payload-2");
    Ok(())
}

fn cyclic_rules(engine: &Engine) -> Result<(), BuildError> {
    let a = "_build/default/a";
    let b = "_build/default/b";
    let mk = |dep: &str, target: &str| {
        let t = p(target);
        let build = build::paths([p(dep)]).map(move |_| Action::WriteFile {
            path: t.clone(),
            contents: String::new(),
        });
        PreRule::new(build, [p(target)])
    };
    engine.add_pre_rule(mk(b, a))?;
    engine.add_pre_rule(mk(a, b))?;
    Ok(())
}

#[test]
fn dependency_cycle_is_reported_in_order() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let engine = space.engine()?;
    cyclic_rules(&engine)?;

    let err = engine
        .do_build_blocking(&[p("_build/default/a")])
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("Dependency cycle"));
    let pos_a = message.find("_build/default/a").unwrap();
    let pos_b = message.find("_build/default/b").unwrap();
    assert!(pos_a < pos_b);

    match err {
        BuildError::Rule { cause, .. } => match &*cause {
            BuildError::Cycle(files) => {
                assert_eq!(
                    files.as_slice(),
                    &[p("_build/default/a"), p("_build/default/b"), p("_build/default/a")]
                );
            }
            other => panic!("expected cycle cause, got {other}"),
        },
        other => panic!("expected annotated rule error, got {other}"),
    }

    // Closure analysis reports the same cycle without executing anything.
    assert!(matches!(
        engine.all_lib_deps(&[p("_build/default/a")]),
        Err(BuildError::Cycle(_))
    ));
    Ok(())
}

#[test]
fn half_written_targets_are_cleaned_up_and_retried() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.txt", "x")?;
    let out = "_build/default/out";

    // The action writes its target, then fails.
    let make_rule = || {
        let t = p(out);
        let build = build::paths([p("a.txt")]).map(move |_| {
            Action::Progn(vec![
                Action::WriteFile {
                    path: t.clone(),
                    contents: "partial".into(),
                },
                Action::Copy {
                    src: p("ghost"),
                    dst: p("_build/default/scratch"),
                },
            ])
        });
        PreRule::new(build, [p(out)])
    };

    let engine = space.engine()?;
    engine.add_pre_rule(make_rule())?;
    let err = engine.do_build_blocking(&[p(out)]).unwrap_err();
    assert!(matches!(err, BuildError::Rule { .. }));
    assert_eq!(space.read(out)?, "partial");
    // Finalisation unlinks the pending target.
    engine.finish()?;
    assert!(!space.exists(out));

    // With the missing input supplied, the next build retries: the digest
    // is unchanged but the target is gone.
    space.write("ghost", "now present")?;
    let engine = space.engine()?;
    engine.add_pre_rule(make_rule())?;
    engine.do_build_blocking(&[p(out)])?;
    engine.finish()?;
    assert_eq!(space.read(out)?, "partial");
    Ok(())
}

#[test]
fn user_rule_wins_over_synthesised_copy_rule() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("s.ml", "let x = source")?;
    space.write("t.ml", "let y = copied")?;

    let engine = space.engine()?;
    engine.add_pre_rule(write_rule("s.ml", "_build/default/s.ml", "let x = generated"))?;
    engine.add_source_copy_rules(&[p("s.ml"), p("t.ml")])?;

    engine.do_build_blocking(&[p("_build/default/s.ml"), p("_build/default/t.ml")])?;
    engine.finish()?;
    assert_eq!(space.read("_build/default/s.ml")?, "let x = generated");
    assert_eq!(space.read("_build/default/t.ml")?, "let y = copied");
    Ok(())
}

#[test]
fn rule_without_dependencies_always_rebuilds() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = "_build/default/stamp";
    let make_rule = || {
        let t = p(out);
        let build = build::paths([]).map(move |_| Action::WriteFile {
            path: t.clone(),
            contents: "stamp".into(),
        });
        PreRule::new(build, [p(out)])
    };

    let engine = space.engine()?;
    engine.add_pre_rule(make_rule())?;
    engine.do_build_blocking(&[p(out)])?;
    engine.finish()?;
    space.age(out, 1000);
    let aged = space.mtime(out);

    // Unchanged rule, existing target: still reruns, by design.
    let engine = space.engine()?;
    engine.add_pre_rule(make_rule())?;
    engine.do_build_blocking(&[p(out)])?;
    engine.finish()?;
    assert_ne!(space.mtime(out), aged);
    Ok(())
}

#[test]
fn updated_in_place_target_is_not_predeleted() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.txt", "x")?;
    let out = "_build/default/version.ml";
    let make_rule = || {
        let t = p(out);
        let build = build::paths([p("a.txt")]).map(move |_| Action::UpdateFile {
            path: t.clone(),
            contents: "let v = 1".into(),
        });
        PreRule::new(build, [p(out)])
    };

    let engine = space.engine()?;
    engine.add_pre_rule(make_rule())?;
    engine.do_build_blocking(&[p(out)])?;
    engine.finish()?;
    assert_eq!(space.read(out)?, "let v = 1");

    // Force a rerun by making the target look old. Because the action
    // updates in place and the contents are unchanged, the file survives
    // untouched: had it been pre-deleted, it would have been rewritten
    // with a fresh mtime.
    space.age(out, 1000);
    let aged = space.mtime(out);
    let engine = space.engine()?;
    engine.add_pre_rule(make_rule())?;
    engine.do_build_blocking(&[p(out)])?;
    engine.finish()?;
    assert_eq!(space.mtime(out), aged);
    Ok(())
}

#[test]
fn glob_and_file_exists_observe_registered_targets() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.txt", "x")?;
    let engine = space.engine()?;
    engine.add_pre_rule(write_rule("a.txt", "_build/default/one.o", "1"))?;
    engine.add_pre_rule(write_rule("a.txt", "_build/default/two.o", "2"))?;
    engine.add_pre_rule(write_rule("a.txt", "_build/default/notes.txt", "n"))?;

    // An archive listing every .o target in the directory; the glob sees
    // registered targets, so the .o rules need not have run yet.
    let archive = p("_build/default/archive");
    let t = archive.clone();
    let build = build::glob(
        p("_build/default"),
        regex::Regex::new(r"\.o$").unwrap(),
    )
    .bind(move |found| {
        let t = t.clone();
        let listing = found
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join("\n");
        build::paths(found).map(move |_| Action::WriteFile {
            path: t.clone(),
            contents: listing.clone(),
        })
    });
    engine.add_pre_rule(PreRule::new(build, [archive.clone()]))?;

    // file_exists is registry membership, not disk state: gen.ml has a
    // rule but has never been built.
    engine.add_pre_rule(write_rule("a.txt", "_build/default/gen.ml", "g"))?;
    let probe = p("_build/default/probe");
    let t = probe.clone();
    let build = build::file_exists(p("_build/default/gen.ml"))
        .both(build::file_exists(p("_build/default/never.ml")))
        .map(move |(registered, unregistered)| Action::WriteFile {
            path: t.clone(),
            contents: format!("{registered} {unregistered}"),
        });
    engine.add_pre_rule(PreRule::new(build, [probe.clone()]))?;

    engine.do_build_blocking(&[archive, probe])?;
    engine.finish()?;
    assert_eq!(
        space.read("_build/default/archive")?,
        "_build/default/one.o\n_build/default/two.o"
    );
    assert_eq!(space.read("_build/default/probe")?, "true false");
    // Building the archive realised the globbed targets.
    assert_eq!(space.read("_build/default/one.o")?, "1");
    Ok(())
}

#[test]
fn lib_deps_aggregate_over_the_closure() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.txt", "x")?;
    let engine = space.engine()?;

    let lib = p("_build/default/lib/lib.cma");
    let t = lib.clone();
    let build = build::record_lib_deps(p("_build/default/lib"), vec!["str".into()])
        .both(build::paths([p("a.txt")]))
        .map(move |_| Action::WriteFile {
            path: t.clone(),
            contents: String::new(),
        });
    engine.add_pre_rule(PreRule::new(build, [lib.clone()]))?;

    let bin = p("_build/default/bin/main.exe");
    let t = bin.clone();
    let build = build::record_lib_deps(p("_build/default/bin"), vec!["re".into(), "str".into()])
        .both(build::paths([lib.clone()]))
        .map(move |_| Action::WriteFile {
            path: t.clone(),
            contents: String::new(),
        });
    engine.add_pre_rule(PreRule::new(build, [bin.clone()]))?;

    let per_dir = engine.all_lib_deps(&[bin.clone()])?;
    assert_eq!(
        per_dir.get(&p("_build/default/lib")),
        Some(&BTreeSet::from(["str".to_owned()]))
    );
    assert_eq!(
        per_dir.get(&p("_build/default/bin")),
        Some(&BTreeSet::from(["re".to_owned(), "str".to_owned()]))
    );

    let by_ctx = engine.all_lib_deps_by_context(&[bin])?;
    assert_eq!(
        by_ctx.get("default"),
        Some(&BTreeSet::from(["re".to_owned(), "str".to_owned()]))
    );

    // Nothing was built by the approximate queries.
    assert!(!space.exists("_build/default/lib/lib.cma"));
    Ok(())
}

#[test]
fn undeclared_target_is_fatal() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.txt", "x")?;
    let engine = space.engine()?;

    // The action writes somewhere else than the declared target.
    let build = build::paths([p("a.txt")]).map(|_| Action::WriteFile {
        path: p("_build/default/elsewhere"),
        contents: String::new(),
    });
    engine.add_pre_rule(PreRule::new(build, [p("_build/default/promised")]))?;

    let err = engine
        .do_build_blocking(&[p("_build/default/promised")])
        .unwrap_err();
    assert!(err.to_string().contains("failed to generate"));
    Ok(())
}

#[test]
fn duplicate_rules_for_a_target_are_rejected() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let engine = space.engine()?;
    engine.add_pre_rule(write_rule("a.txt", "_build/default/x", "1"))?;
    let err = engine
        .add_pre_rule(write_rule("a.txt", "_build/default/x", "2"))
        .unwrap_err();
    assert!(matches!(err, BuildError::MultipleRules(path) if path == p("_build/default/x")));
    Ok(())
}

#[test]
fn stale_artifacts_are_collected_before_building() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.txt", "x")?;
    std::fs::create_dir_all(space.dir.path().join("_build/default/old"))?;
    space.write("_build/default/stale.o", "junk")?;
    space.write("_build/default/old/leftover", "junk")?;

    let out = "_build/default/fresh";
    let engine = space.engine()?;
    engine.add_pre_rule(write_rule("a.txt", out, "f"))?;
    engine.do_build_blocking(&[p(out)])?;
    engine.finish()?;

    assert!(!space.exists("_build/default/stale.o"));
    // Emptied directories are removed too.
    assert!(!space.exists("_build/default/old"));
    assert!(space.exists(out));
    Ok(())
}

#[test]
fn install_dir_is_garbage_collected_too() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("a.txt", "x")?;
    std::fs::create_dir_all(space.dir.path().join("_install/bin"))?;
    space.write("_install/bin/stale", "junk")?;

    let ctx = Context::new("default").with_install_dir(p("_install"));
    let engine = Engine::new(space.dir.path(), vec![ctx])?;
    engine.add_pre_rule(write_rule("a.txt", "_install/bin/tool", "t"))?;
    engine.do_build_blocking(&[p("_install/bin/tool")])?;
    engine.finish()?;

    assert!(!space.exists("_install/bin/stale"));
    assert_eq!(space.read("_install/bin/tool")?, "t");
    Ok(())
}

#[cfg(unix)]
mod unix {
    use super::*;

    fn sh(dir: &str, script: &str) -> Action {
        Action::Run {
            dir: p(dir),
            prog: "sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[test]
    fn multi_target_rule_runs_at_most_once() -> anyhow::Result<()> {
        let space = TestSpace::new()?;
        space.write("a.txt", "x")?;
        let (x, y) = (p("_build/default/x"), p("_build/default/y"));

        let (tx, ty) = (x.clone(), y.clone());
        let build = build::paths([p("a.txt")]).map(move |_| {
            Action::Progn(vec![
                sh(".", "echo run >> runs.log"),
                Action::WriteFile {
                    path: tx.clone(),
                    contents: "x".into(),
                },
                Action::WriteFile {
                    path: ty.clone(),
                    contents: "y".into(),
                },
            ])
        });
        let engine = space.engine()?;
        engine.add_pre_rule(PreRule::new(build, [x.clone(), y.clone()]))?;

        // Both targets demanded concurrently; the shared rule runs once.
        engine.do_build_blocking(&[x, y])?;
        engine.finish()?;
        assert_eq!(space.read("runs.log")?.lines().count(), 1);
        Ok(())
    }

    #[test]
    fn sandbox_blocks_undeclared_reads() -> anyhow::Result<()> {
        let space = TestSpace::new()?;
        space.write("dep.txt", "declared")?;
        space.write("secret.txt", "undeclared")?;
        let out = "_build/default/out";

        let rule = |script: &str| {
            let action = sh(".", script);
            let build = build::paths([p("dep.txt")]).map(move |_| action.clone());
            PreRule::new(build, [p(out)]).sandboxed()
        };

        // Reading the declared dependency works; the output is exported
        // from the sandbox to its real location.
        let engine = space.engine()?;
        engine.add_pre_rule(rule("cat dep.txt > _build/default/out"))?;
        engine.do_build_blocking(&[p(out)])?;
        engine.finish()?;
        assert_eq!(space.read(out)?, "declared");

        // An undeclared sibling is not materialised in the sandbox, so
        // reading it fails even though it exists in the workspace.
        let engine = space.engine()?;
        engine.add_pre_rule(rule("cat secret.txt > _build/default/out"))?;
        let err = engine.do_build_blocking(&[p(out)]).unwrap_err();
        assert!(err.to_string().contains("action failed"));
        Ok(())
    }

    #[test]
    fn failed_sandbox_directory_is_retained() -> anyhow::Result<()> {
        let space = TestSpace::new()?;
        space.write("dep.txt", "d")?;
        let out = "_build/default/out";
        let action = sh(".", "exit 1");
        let build = build::paths([p("dep.txt")]).map(move |_| action.clone());

        let engine = space.engine()?;
        engine.add_pre_rule(PreRule::new(build, [p(out)]).sandboxed())?;
        engine.do_build_blocking(&[p(out)]).unwrap_err();
        drop(engine);

        let sandboxes: Vec<_> = std::fs::read_dir(space.dir.path().join("_build/.sandbox"))?
            .collect::<Result<_, _>>()?;
        assert_eq!(sandboxes.len(), 1);
        Ok(())
    }
}
