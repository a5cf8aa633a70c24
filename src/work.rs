//! Deciding whether each target needs rebuilding, and driving the builds in
//! dependency order, serially or across a worker pool.

use crate::db;
use crate::engine::Engine;
use crate::graph::FileId;
use crate::hash::CHANGED;
use crate::pool::{Task, TaskPool};
use crate::task;
use std::collections::{HashMap, HashSet};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

pub struct Builder<'a> {
    engine: &'a Engine,
    /// Nodes whose build task completed, so ancestors skip re-scheduling.
    built_ok: Mutex<HashSet<FileId>>,
    /// File mtimes in nanoseconds, cached per run.
    mtimes: Mutex<HashMap<String, i64>>,
}

impl<'a> Builder<'a> {
    pub fn new(engine: &'a Engine) -> Builder<'a> {
        Builder {
            engine,
            built_ok: Mutex::new(HashSet::new()),
            mtimes: Mutex::new(HashMap::new()),
        }
    }

    fn mtime(&self, path: &str) -> i64 {
        if let Some(&mtime) = self.mtimes.lock().unwrap().get(path) {
            return mtime;
        }
        let Ok(meta) = std::fs::metadata(path) else {
            return -1;
        };
        let mtime = meta.mtime() * 1_000_000_000 + meta.mtime_nsec();
        self.mtimes.lock().unwrap().insert(path.to_string(), mtime);
        mtime
    }

    /// Build `id` (deps first), returning whether any work actually ran.
    pub fn build(&self, id: FileId) -> anyhow::Result<bool> {
        let progress = self.engine.progress();
        let debug = progress.debug_level() > 0;

        let (deps, file) = {
            let inner = self.engine.lock_inner();
            let node = inner.graph.node(id);
            if node.build_done && !node.forced_build {
                return Ok(node.has_been_built);
            }
            (node.deps.clone(), node.file.clone())
        };

        let mut deps_built = false;
        for &dep in &deps {
            let ran = self.build(dep)?;
            if ran && !deps_built && debug {
                let dep_file = self.engine.lock_inner().graph.node(dep).file.clone();
                progress.debug(
                    1,
                    &format!(
                        "build {} since the dependency '{}' has been built",
                        file, dep_file
                    ),
                );
            }
            deps_built |= ran;
        }

        let composed = {
            let mut inner = self.engine.lock_inner();
            crate::compose::compose_command(
                &mut inner,
                self.engine.paths(),
                self.engine.opt_override(),
                progress,
                id,
            )?
        };
        if !composed {
            return Ok(false);
        }

        let (cmd, cwd, name, generated_by_dep, forced) = {
            let inner = self.engine.lock_inner();
            let node = inner.graph.node(id);
            (
                node.cmd.clone().unwrap_or_default(),
                node.cwd.clone(),
                node.name.clone(),
                node.generated_by_dep,
                node.forced_build,
            )
        };

        let mut need = deps_built;
        if !need {
            let meta = std::fs::metadata(&file);
            match &meta {
                Err(_) => {
                    need = true;
                    if debug {
                        progress.debug(1, &format!("build {} since it doesn't exist", file));
                    }
                }
                Ok(meta) if meta.len() == 0 => need = true,
                Ok(_) => {}
            }
            if !need && forced {
                need = true;
                if debug {
                    progress.debug(1, &format!("build {} since it was forced", file));
                }
            }
        }
        if !need && !generated_by_dep {
            let stored = db::read_cmd(&file);
            if cmd != stored {
                need = true;
                if debug {
                    progress.debug(
                        1,
                        &format!(
                            "build {} since the cmd '{}' has been changed to '{}'",
                            file, stored, cmd
                        ),
                    );
                }
            }
        }
        if !need {
            let my_mtime = self.mtime(&file);
            for &dep in &deps {
                let dep_file = self.engine.lock_inner().graph.node(dep).file.clone();
                if dep_file.is_empty() || !Path::new(&dep_file).exists() {
                    continue;
                }
                if self.mtime(&dep_file) >= my_mtime {
                    // A touched-but-unchanged dep is not a reason to rebuild.
                    if !self.engine.hashes().check(&dep_file)?.starts_with(CHANGED) {
                        continue;
                    }
                    need = true;
                    if debug {
                        progress.debug(
                            1,
                            &format!(
                                "build {} since the mtime({}) of dependence '{}' is bigger than target's mtime({})",
                                file,
                                self.mtime(&dep_file),
                                dep_file,
                                my_mtime
                            ),
                        );
                    }
                    break;
                }
            }
        }

        if need {
            self.engine.lock_inner().graph.node_mut(id).has_been_built = true;
            if generated_by_dep {
                // No command of our own: force deps to rebuild until the
                // file appears as their side effect.
                for &dep in &deps {
                    if Path::new(&file).exists() {
                        break;
                    }
                    let dep_file = self.engine.lock_inner().graph.node(dep).file.clone();
                    progress.debug(1, &format!("generate {} by build dep({})", file, dep_file));
                    self.engine.lock_inner().graph.node_mut(dep).forced_build = true;
                    self.build(dep)?;
                }
            } else {
                db::write_cmd(&file, &cmd)?;
                let result = task::run_command(Path::new(&cwd), &cmd)?;
                progress.report_target(
                    &name,
                    &file,
                    result.success,
                    result.spend_ms,
                    &format!("(cd {}; {})", cwd, cmd),
                );
                if !result.success {
                    task::fatal_abort();
                }
                self.engine.lock_inner().graph.node_mut(id).forced_build = false;
            }
        }

        let mut inner = self.engine.lock_inner();
        let node = inner.graph.node_mut(id);
        node.build_done = true;
        Ok(node.has_been_built)
    }
}

/// Refcounted token held by every scheduled dep of a node; the last drop
/// enqueues the node's own build task.
trait Hold: Send + Sync {}

struct DoneSentinel {
    tx: Mutex<mpsc::Sender<()>>,
}
impl Hold for DoneSentinel {}
impl Drop for DoneSentinel {
    fn drop(&mut self) {
        let _ = self.tx.lock().unwrap().send(());
    }
}

struct NodeSentinel<'a> {
    pool: Arc<TaskPool<'a>>,
    task: Mutex<Option<Task<'a>>>,
}
impl Hold for NodeSentinel<'_> {}
impl Drop for NodeSentinel<'_> {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            self.pool.push(task);
        }
    }
}

fn schedule<'a>(
    builder: &'a Builder<'a>,
    pool: &Arc<TaskPool<'a>>,
    id: FileId,
    parent: Arc<dyn Hold + 'a>,
) {
    if builder.built_ok.lock().unwrap().contains(&id) {
        return;
    }
    let (signature, deps) = {
        let inner = builder.engine.lock_inner();
        let node = inner.graph.node(id);
        // A finished node's task would return immediately; skip its subtree.
        if node.build_done && !node.forced_build {
            return;
        }
        (node.file.clone(), node.deps.clone())
    };

    let run = Box::new(move || {
        let _wakes_parent_when_dropped = parent;
        if let Err(err) = builder.build(id) {
            builder.engine.progress().error(&format!("{:#}", err));
            std::process::exit(1);
        }
        builder.built_ok.lock().unwrap().insert(id);
    });
    let sentinel = Arc::new(NodeSentinel {
        pool: pool.clone(),
        task: Mutex::new(Some(Task { signature, run })),
    });
    for &dep in &deps {
        schedule(builder, pool, dep, sentinel.clone());
    }
    // When this node has no pending deps, the sentinel drops right here and
    // the task is queued immediately.
}

/// Build all `targets` across `jobs` worker threads, deps before dependents,
/// with each node's command executed exactly once no matter how many
/// ancestors requested it.
pub fn build_parallel(builder: &Builder, targets: &[FileId], jobs: usize) {
    let pool = Arc::new(TaskPool::new());
    let (tx, rx) = mpsc::channel();
    std::thread::scope(|scope| {
        for _ in 0..jobs {
            let pool = pool.clone();
            scope.spawn(move || pool.run_worker());
        }
        {
            let done: Arc<dyn Hold + '_> = Arc::new(DoneSentinel { tx: Mutex::new(tx) });
            for &target in targets {
                schedule(builder, &pool, target, done.clone());
            }
        }
        // All top-level sentinels have fired once every scheduled task has
        // run and released its token.
        let _ = rx.recv();
        pool.stop();
    });
}
