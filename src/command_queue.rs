//! FIFO of unit-of-work closures with a single in-flight item (§4.5, C5).

use crate::api::BDAddr;
use crate::constants::DEFAULT_RETRY_CAP;
use crate::executor::Executor;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// The expected completion signal for a queued command (§4.5).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CompletionTag {
    Discovering,
    Powered,
    Connected,
    GattValue { object_path: String },
    Notifying { object_path: String },
}

/// One queued unit of work.
pub struct Command {
    pub tag: CompletionTag,
    pub device_address: Option<BDAddr>,
    pub retry_count: u8,
    body: Mutex<Option<Box<dyn FnOnce() + Send + 'static>>>,
}

impl Command {
    pub fn new(tag: CompletionTag, device_address: Option<BDAddr>, body: impl FnOnce() + Send + 'static) -> Self {
        Command {
            tag,
            device_address,
            retry_count: 0,
            body: Mutex::new(Some(Box::new(body))),
        }
    }

    fn take_body(&self) -> Option<Box<dyn FnOnce() + Send + 'static>> {
        self.body.lock().unwrap().take()
    }
}

struct State {
    busy: bool,
    queue: VecDeque<Arc<Command>>,
    current_device: Option<BDAddr>,
}

/// Single-owner FIFO guarded by one mutex (§4.5, §5 "shared-resource
/// policy"). Commands run on the [`Executor`] supplied at construction.
pub struct CommandQueue {
    state: Mutex<State>,
    executor: Arc<Executor>,
}

impl CommandQueue {
    pub fn new(executor: Arc<Executor>) -> Arc<Self> {
        Arc::new(CommandQueue {
            state: Mutex::new(State {
                busy: false,
                queue: VecDeque::new(),
                current_device: None,
            }),
            executor,
        })
    }

    /// Appends `cmd` and, if nothing is in-flight, advances the queue.
    pub fn enqueue(self: &Arc<Self>, cmd: Command) {
        let cmd = Arc::new(cmd);
        {
            let mut state = self.state.lock().unwrap();
            state.queue.push_back(cmd);
        }
        self.next();
    }

    /// If idle, pops nothing but dispatches the head to the executor.
    pub fn next(self: &Arc<Self>) {
        let head = {
            let mut state = self.state.lock().unwrap();
            if state.busy {
                return;
            }
            let head = match state.queue.front() {
                Some(h) => h.clone(),
                None => return,
            };
            state.busy = true;
            state.current_device = head.device_address;
            head
        };

        if let Some(body) = head.take_body() {
            let this = self.clone();
            self.executor.post(move || {
                body();
                let _ = &this;
            });
        }
    }

    /// Pops the head, clears `busy`/`current_*`, and advances the queue
    /// (§4.5 `complete()`).
    pub fn complete(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().unwrap();
            state.queue.pop_front();
            state.busy = false;
            state.current_device = None;
        }
        self.next();
    }

    /// Re-arms the same head until `DEFAULT_RETRY_CAP` is reached; beyond
    /// the cap, pops and proceeds like `complete()` (§4.5 `retry()`). The
    /// retry path is never exercised by the current component set (§9) but
    /// is preserved for forward compatibility.
    pub fn retry(self: &Arc<Self>) {
        let exceeded = {
            let mut state = self.state.lock().unwrap();
            state.busy = false;
            match state.queue.front() {
                Some(head) if head.retry_count < DEFAULT_RETRY_CAP => false,
                _ => true,
            }
        };
        if exceeded {
            self.complete();
        } else {
            self.next();
        }
    }

    /// Matches a completion signal against the in-flight command. Returns
    /// `true` and completes the queue if the tag and device address match.
    pub fn try_complete_matching(self: &Arc<Self>, tag: &CompletionTag, device_address: Option<BDAddr>) -> bool {
        let matches = {
            let state = self.state.lock().unwrap();
            match state.queue.front() {
                Some(head) if state.busy && &head.tag == tag && state.current_device == device_address => true,
                _ => false,
            }
        };
        if matches {
            self.complete();
        }
        matches
    }

    /// Drains all queued commands and clears `busy`, e.g. on disconnect
    /// (§4.5 "On disconnect, the Peripheral's queue is drained").
    pub fn drain(&self) {
        let mut state = self.state.lock().unwrap();
        state.queue.clear();
        state.busy = false;
        state.current_device = None;
    }

    pub fn in_flight_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        if state.busy { 1 } else { 0 }
    }

    pub fn is_busy(&self) -> bool {
        self.state.lock().unwrap().busy
    }
}

static_assertions::assert_impl_all!(CommandQueue: Sync, Send);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn at_most_one_command_in_flight() {
        let exec = Executor::new("test-queue");
        let queue = CommandQueue::new(exec);
        let (tx, rx) = mpsc::channel();

        for i in 0..3 {
            let tx = tx.clone();
            let q2 = queue.clone();
            queue.enqueue(Command::new(CompletionTag::Connected, None, move || {
                assert_eq!(q2.in_flight_count(), 1);
                tx.send(i).unwrap();
                q2.complete();
            }));
        }

        let results: Vec<_> = rx.iter().take(3).collect();
        assert_eq!(results, vec![0, 1, 2]);
        let _ = Duration::from_millis(0);
    }

    #[test]
    fn drain_clears_busy_and_queue() {
        let exec = Executor::new("test-drain");
        let queue = CommandQueue::new(exec);
        queue.enqueue(Command::new(CompletionTag::Connected, None, || {}));
        queue.drain();
        assert!(!queue.is_busy());
    }
}
