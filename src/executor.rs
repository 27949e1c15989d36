//! Named single-thread task runner (§4.1, C3): immediate and delayed
//! posting, used for the callback, queue, and signal threads of each
//! Central and Peripheral (§5).

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Delayed {
    fire_at: Instant,
    seq: u64,
    task: Option<Task>,
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}
impl Eq for Delayed {}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap; we want earliest fire_at (then lowest
        // seq, to break simultaneous-fire ties in submission order) first.
        other
            .fire_at
            .cmp(&self.fire_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

enum Item {
    Immediate(Task),
    Shutdown,
}

struct Shared {
    immediate: Mutex<Vec<Item>>,
    delayed: Mutex<BinaryHeap<Delayed>>,
    cv: Condvar,
    next_seq: AtomicU64,
    shutdown: AtomicBool,
}

/// A cancellable handle for a task scheduled with [`Executor::post_delayed`].
#[derive(Clone)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
}

impl TaskHandle {
    /// Best-effort cancellation; safe to call after the task has already
    /// run or been dequeued (§4.1 `cancel`).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// A named single-threaded executor (§4.1/§2 C3, "Handler").
pub struct Executor {
    name: String,
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Executor {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let shared = Arc::new(Shared {
            immediate: Mutex::new(Vec::new()),
            delayed: Mutex::new(BinaryHeap::new()),
            cv: Condvar::new(),
            next_seq: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
        });

        let name = name.into();
        let worker_shared = shared.clone();
        let worker_name = name.clone();
        let join = thread::Builder::new()
            .name(worker_name.clone())
            .spawn(move || run_loop(worker_shared, worker_name))
            .expect("failed to spawn executor thread");

        Arc::new(Executor {
            name,
            shared,
            handle: Mutex::new(Some(join)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedules `task` for immediate sequential execution, preserving
    /// submission order relative to other `post` calls.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            log::warn!("executor \"{}\" rejected a post() after shutdown", self.name);
            return;
        }
        let mut q = self.shared.immediate.lock().unwrap();
        q.push(Item::Immediate(Box::new(task)));
        drop(q);
        self.shared.cv.notify_one();
    }

    /// Schedules `task` to run at `now + delay_ms`. Returns a handle that
    /// can cancel the task before it fires (§4.1 `post_delayed`).
    pub fn post_delayed(&self, task: impl FnOnce() + Send + 'static, delay: Duration) -> TaskHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        if self.shared.shutdown.load(Ordering::SeqCst) {
            log::warn!("executor \"{}\" rejected a post_delayed() after shutdown", self.name);
            return TaskHandle { cancelled };
        }
        let seq = self.shared.next_seq.fetch_add(1, Ordering::SeqCst);
        let entry = Delayed {
            fire_at: Instant::now() + delay,
            seq,
            task: Some(Box::new(task)),
            cancelled: cancelled.clone(),
        };
        let mut heap = self.shared.delayed.lock().unwrap();
        heap.push(entry);
        drop(heap);
        self.shared.cv.notify_one();
        TaskHandle { cancelled }
    }

    /// Drains in-flight work then rejects further submissions.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        {
            let mut q = self.shared.immediate.lock().unwrap();
            q.push(Item::Shutdown);
        }
        self.shared.cv.notify_all();
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(shared: Arc<Shared>, name: String) {
    loop {
        let next_deadline = {
            let heap = shared.delayed.lock().unwrap();
            heap.peek().map(|d| d.fire_at)
        };

        let item = {
            let mut q = shared.immediate.lock().unwrap();
            if q.is_empty() {
                let wait = next_deadline
                    .map(|d| d.saturating_duration_since(Instant::now()))
                    .unwrap_or(Duration::from_millis(200));
                let (guard, _timeout) = shared.cv.wait_timeout(q, wait).unwrap();
                q = guard;
            }
            if q.is_empty() {
                None
            } else {
                Some(q.remove(0))
            }
        };

        match item {
            Some(Item::Shutdown) => break,
            Some(Item::Immediate(task)) => run_task(&name, task),
            None => {}
        }

        // Drain matured delayed tasks, in fire-time (then submission) order.
        loop {
            let due = {
                let mut heap = shared.delayed.lock().unwrap();
                match heap.peek() {
                    Some(d) if d.fire_at <= Instant::now() => heap.pop(),
                    _ => None,
                }
            };
            match due {
                Some(mut d) => {
                    if !d.cancelled.load(Ordering::SeqCst) {
                        if let Some(task) = d.task.take() {
                            run_task(&name, task);
                        }
                    }
                }
                None => break,
            }
        }

        if shared.shutdown.load(Ordering::SeqCst) {
            let q = shared.immediate.lock().unwrap();
            if q.is_empty() {
                break;
            }
        }
    }
}

/// Runs one task, catching panics so a misbehaving task never poisons the
/// executor (§4.1 "Exceptions in a task are caught, logged...").
fn run_task(name: &str, task: Task) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        log::error!("task on executor \"{}\" panicked: {}", name, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn runs_posts_in_submission_order() {
        let exec = Executor::new("test-order");
        let (tx, rx) = mpsc::channel();
        for label in ["first", "second", "third"] {
            let tx = tx.clone();
            exec.post(move || tx.send(label.to_string()).unwrap());
        }
        let results: Vec<_> = rx.iter().take(3).collect();
        assert_eq!(results, vec!["first", "second", "third"]);
    }

    #[test]
    fn immediate_tasks_run_before_a_later_delayed_one() {
        let exec = Executor::new("test-delay-order");
        let (tx, rx) = mpsc::channel();

        let tx1 = tx.clone();
        exec.post_delayed(move || tx1.send("delayed".to_string()).unwrap(), Duration::from_millis(50));
        let tx2 = tx.clone();
        exec.post(move || tx2.send("immediate-1".to_string()).unwrap());
        let tx3 = tx.clone();
        exec.post(move || tx3.send("immediate-2".to_string()).unwrap());

        let results: Vec<_> = rx.iter().take(3).collect();
        assert_eq!(results, vec!["immediate-1", "immediate-2", "delayed"]);
    }

    #[test]
    fn cancelled_delayed_task_never_runs() {
        let exec = Executor::new("test-cancel");
        let (tx, rx) = mpsc::channel();
        let handle = exec.post_delayed(move || tx.send(()).unwrap(), Duration::from_millis(30));
        handle.cancel();
        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    }
}
