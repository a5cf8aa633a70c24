//! A worker pool whose queue is keyed by task signature.
//!
//! The same build node can be enqueued by many ancestors; the signature set
//! guarantees at most one worker ever executes tasks for a given signature
//! at a time.  A task whose signature is busy goes back to the queue and the
//! worker waits for a wake-up.

use std::collections::{HashSet, VecDeque};
use std::sync::{Condvar, Mutex};

pub struct Task<'a> {
    pub signature: String,
    pub run: Box<dyn FnOnce() + Send + 'a>,
}

pub struct TaskPool<'a> {
    state: Mutex<PoolState<'a>>,
    cond: Condvar,
}

struct PoolState<'a> {
    queue: VecDeque<Task<'a>>,
    running: HashSet<String>,
    stopping: bool,
}

/// Build workers are I/O bound on subprocesses, so the default pool is a
/// quarter of the hardware threads.
pub fn default_parallelism() -> usize {
    let n = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    std::cmp::max(1, n / 4)
}

impl<'a> TaskPool<'a> {
    pub fn new() -> TaskPool<'a> {
        TaskPool {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                running: HashSet::new(),
                stopping: false,
            }),
            cond: Condvar::new(),
        }
    }

    pub fn push(&self, task: Task<'a>) {
        self.state.lock().unwrap().queue.push_back(task);
        self.cond.notify_one();
    }

    /// Worker loop; returns once `stop` is called.
    pub fn run_worker(&self) {
        loop {
            let task = {
                let mut state = self.state.lock().unwrap();
                loop {
                    if state.stopping {
                        return;
                    }
                    let mut found = None;
                    // One rotation through the queue; tasks whose signature
                    // is already running cycle to the back.
                    for _ in 0..state.queue.len() {
                        let t = state.queue.pop_front().unwrap();
                        if state.running.insert(t.signature.clone()) {
                            found = Some(t);
                            break;
                        }
                        state.queue.push_back(t);
                    }
                    match found {
                        Some(t) => break t,
                        None => state = self.cond.wait(state).unwrap(),
                    }
                }
            };
            let signature = task.signature;
            (task.run)();
            self.state.lock().unwrap().running.remove(&signature);
            // Wake workers parked on a duplicate of this signature.
            self.cond.notify_all();
        }
    }

    pub fn stop(&self) {
        self.state.lock().unwrap().stopping = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn duplicate_signatures_never_overlap() {
        let active = AtomicUsize::new(0);
        let max_active = AtomicUsize::new(0);
        let done = AtomicUsize::new(0);
        let pool = TaskPool::new();
        let total = 16;

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| pool.run_worker());
            }
            for _ in 0..total {
                pool.push(Task {
                    signature: "only-one".to_string(),
                    run: Box::new(|| {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_active.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(1));
                        active.fetch_sub(1, Ordering::SeqCst);
                        done.fetch_add(1, Ordering::SeqCst);
                    }),
                });
            }
            while done.load(Ordering::SeqCst) < total {
                std::thread::sleep(Duration::from_millis(1));
            }
            pool.stop();
        });

        assert_eq!(done.load(Ordering::SeqCst), total);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn distinct_signatures_all_run() {
        let done = AtomicUsize::new(0);
        let pool = TaskPool::new();
        std::thread::scope(|scope| {
            for _ in 0..2 {
                scope.spawn(|| pool.run_worker());
            }
            for i in 0..32 {
                pool.push(Task {
                    signature: format!("task-{}", i),
                    run: Box::new(|| {
                        done.fetch_add(1, Ordering::SeqCst);
                    }),
                });
            }
            while done.load(Ordering::SeqCst) < 32 {
                std::thread::sleep(Duration::from_millis(1));
            }
            pool.stop();
        });
        assert_eq!(done.load(Ordering::SeqCst), 32);
    }
}
