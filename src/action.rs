//! The concrete action language: what a rule actually does once its
//! dependencies are up to date. Actions are hashable (via their canonical
//! form), sandboxable (path rewriting), and execute asynchronously.
//! Subprocesses run on a helper thread so the engine's cooperative
//! scheduler only suspends while waiting for completion.

use std::collections::BTreeSet;
use std::path::Path;

use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use futures::FutureExt;
use tracing::debug;

use crate::db::quote_atom;
use crate::error::BuildError;
use crate::path::BuildPath;

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Spawn `prog args` with `dir` as working directory.
    Run {
        dir: BuildPath,
        prog: String,
        args: Vec<String>,
    },
    /// Copy a file.
    Copy { src: BuildPath, dst: BuildPath },
    /// Truncate-write a file.
    WriteFile { path: BuildPath, contents: String },
    /// Write a file only if its contents differ. The target counts as
    /// updated in place: the engine must not pre-delete it.
    UpdateFile { path: BuildPath, contents: String },
    /// Run sub-actions in sequence.
    Progn(Vec<Action>),
}

impl Action {
    /// Stable S-expression rendering, the canonical form fed to the rule
    /// digest.
    pub fn canonical(&self) -> String {
        match self {
            Action::Run { dir, prog, args } => {
                let mut s = format!(
                    "(run (dir {}) (prog {}) (args",
                    quote_atom(&dir.to_string()),
                    quote_atom(prog)
                );
                for arg in args {
                    s.push(' ');
                    s.push_str(&quote_atom(arg));
                }
                s.push_str("))");
                s
            }
            Action::Copy { src, dst } => format!(
                "(copy {} {})",
                quote_atom(&src.to_string()),
                quote_atom(&dst.to_string())
            ),
            Action::WriteFile { path, contents } => format!(
                "(write-file {} {})",
                quote_atom(&path.to_string()),
                quote_atom(contents)
            ),
            Action::UpdateFile { path, contents } => format!(
                "(update-file {} {})",
                quote_atom(&path.to_string()),
                quote_atom(contents)
            ),
            Action::Progn(actions) => {
                let mut s = String::from("(progn");
                for a in actions {
                    s.push(' ');
                    s.push_str(&a.canonical());
                }
                s.push(')');
                s
            }
        }
    }

    /// Declared working directory, when the action has one.
    pub fn dir(&self) -> Option<&BuildPath> {
        match self {
            Action::Run { dir, .. } => Some(dir),
            _ => None,
        }
    }

    /// Target files this action updates in place; they must not be
    /// deleted before execution.
    pub fn updated_files(&self) -> BTreeSet<BuildPath> {
        let mut files = BTreeSet::new();
        self.collect_updated(&mut files);
        files
    }

    fn collect_updated(&self, files: &mut BTreeSet<BuildPath>) {
        match self {
            Action::UpdateFile { path, .. } => {
                files.insert(path.clone());
            }
            Action::Progn(actions) => {
                for a in actions {
                    a.collect_updated(files);
                }
            }
            _ => {}
        }
    }

    /// Rewrites every embedded path through `map`. The mapping is expected
    /// to leave external paths untouched.
    pub fn sandboxed(&self, map: &dyn Fn(&BuildPath) -> BuildPath) -> Action {
        match self {
            Action::Run { dir, prog, args } => Action::Run {
                dir: map(dir),
                prog: prog.clone(),
                args: args.clone(),
            },
            Action::Copy { src, dst } => Action::Copy {
                src: map(src),
                dst: map(dst),
            },
            Action::WriteFile { path, contents } => Action::WriteFile {
                path: map(path),
                contents: contents.clone(),
            },
            Action::UpdateFile { path, contents } => Action::UpdateFile {
                path: map(path),
                contents: contents.clone(),
            },
            Action::Progn(actions) => {
                Action::Progn(actions.iter().map(|a| a.sandboxed(map)).collect())
            }
        }
    }

    /// Executes the action. Failure is terminal for the build; there are
    /// no retries.
    pub fn exec(&self, root: &Path) -> LocalBoxFuture<'static, Result<(), BuildError>> {
        let action = self.clone();
        let root = root.to_path_buf();
        async move { exec_action(&action, &root).await }.boxed_local()
    }
}

fn exec_action<'a>(
    action: &'a Action,
    root: &'a Path,
) -> LocalBoxFuture<'a, Result<(), BuildError>> {
    async move {
        match action {
            Action::Run { dir, prog, args } => run_process(root, dir, prog, args).await,
            Action::Copy { src, dst } => {
                std::fs::copy(src.resolve(root), dst.resolve(root))
                    .map_err(|err| BuildError::io(dst, err))?;
                Ok(())
            }
            Action::WriteFile { path, contents } => {
                std::fs::write(path.resolve(root), contents)
                    .map_err(|err| BuildError::io(path, err))
            }
            Action::UpdateFile { path, contents } => {
                let on_disk = path.resolve(root);
                match std::fs::read_to_string(&on_disk) {
                    Ok(current) if current == *contents => Ok(()),
                    Ok(_) | Err(_) => std::fs::write(&on_disk, contents)
                        .map_err(|err| BuildError::io(path, err)),
                }
            }
            Action::Progn(actions) => {
                for a in actions {
                    exec_action(a, root).await?;
                }
                Ok(())
            }
        }
    }
    .boxed_local()
}

async fn run_process(
    root: &Path,
    dir: &BuildPath,
    prog: &str,
    args: &[String],
) -> Result<(), BuildError> {
    let cwd = dir.resolve(root);
    let prog = prog.to_owned();
    let args = args.to_owned();
    debug!(prog = %prog, dir = %cwd.display(), "spawning");

    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        let result = run_command(&cwd, &prog, &args);
        // The send only fails if the engine stopped waiting.
        let _ = tx.send(result);
    });
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(BuildError::Internal(
            "subprocess thread dropped its result".into(),
        )),
    }
}

fn run_command(cwd: &Path, prog: &str, args: &[String]) -> Result<(), BuildError> {
    let output = std::process::Command::new(prog)
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|err| BuildError::ActionFailed {
            message: format!("spawn {}: {}", prog, err),
        })?;
    if output.status.success() {
        return Ok(());
    }
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Err(BuildError::ActionFailed {
        message: format!("{} {}: {}", prog, output.status, text.trim_end()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_distinguishes_actions() {
        let copy = Action::Copy {
            src: BuildPath::local("a"),
            dst: BuildPath::local("b"),
        };
        let write = Action::WriteFile {
            path: BuildPath::local("b"),
            contents: "a".into(),
        };
        assert_ne!(copy.canonical(), write.canonical());
        assert_eq!(copy.canonical(), copy.canonical());
    }

    #[test]
    fn updated_files_recurses_through_progn() {
        let action = Action::Progn(vec![
            Action::Copy {
                src: BuildPath::local("a"),
                dst: BuildPath::local("b"),
            },
            Action::UpdateFile {
                path: BuildPath::local("c"),
                contents: "x".into(),
            },
        ]);
        let updated = action.updated_files();
        assert_eq!(updated.len(), 1);
        assert!(updated.contains(&BuildPath::local("c")));
    }

    #[test]
    fn sandboxed_rewrites_embedded_paths() {
        let action = Action::Copy {
            src: BuildPath::local("a"),
            dst: BuildPath::local("b"),
        };
        let mapped = action.sandboxed(&|p| BuildPath::local("sb").join(p.as_path()));
        assert_eq!(
            mapped,
            Action::Copy {
                src: BuildPath::local("sb/a"),
                dst: BuildPath::local("sb/b"),
            }
        );
    }

    #[test]
    fn write_and_copy_execute() {
        let dir = tempfile::tempdir().unwrap();
        let action = Action::Progn(vec![
            Action::WriteFile {
                path: BuildPath::local("a"),
                contents: "hello".into(),
            },
            Action::Copy {
                src: BuildPath::local("a"),
                dst: BuildPath::local("b"),
            },
        ]);
        futures::executor::block_on(action.exec(dir.path())).unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("b")).unwrap(), "hello");
    }

    #[cfg(unix)]
    #[test]
    fn failing_process_reports_output() {
        let dir = tempfile::tempdir().unwrap();
        let action = Action::Run {
            dir: BuildPath::local("."),
            prog: "sh".into(),
            args: vec!["-c".into(), "echo oh no; exit 3".into()],
        };
        let err = futures::executor::block_on(action.exec(dir.path())).unwrap_err();
        match err {
            BuildError::ActionFailed { message } => assert!(message.contains("oh no")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
