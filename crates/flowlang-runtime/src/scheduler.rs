//! Task admission scheduling.
//!
//! Two modes. `Unbounded` admits every ready task immediately; `Bounded`
//! gates admission behind `max_concurrency` slots, picking waiters by
//! priority with FIFO order inside the same effective level. A waiter past
//! `starvation_timeout` is treated as Critical at selection time, so a
//! stream of high-priority tasks cannot starve it forever. Admission is the
//! only lever: once admitted, a task runs until it suspends cooperatively.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use flowlang_core::dag::Priority;

/// Scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum SchedulerConfig {
    /// Every ready task is admitted immediately.
    #[default]
    Unbounded,
    Bounded {
        max_concurrency: usize,
        starvation_timeout: Duration,
    },
}

/// The admission gate shared by one runtime.
#[derive(Clone, Default)]
pub struct Scheduler {
    bounded: Option<Arc<Bounded>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Scheduler {
        match config {
            SchedulerConfig::Unbounded => Scheduler { bounded: None },
            SchedulerConfig::Bounded {
                max_concurrency,
                starvation_timeout,
            } => Scheduler {
                bounded: Some(Arc::new(Bounded {
                    state: Mutex::new(BoundedState {
                        free: max_concurrency.max(1),
                        queue: Vec::new(),
                        next_seq: 0,
                    }),
                    starvation_timeout,
                })),
            },
        }
    }

    /// Waits for admission; the returned permit readmits the next waiter
    /// when dropped.
    pub async fn admit(&self, priority: Priority) -> Permit {
        let Some(bounded) = &self.bounded else {
            return Permit { bounded: None };
        };

        let rx = {
            let mut state = bounded.state.lock();
            if state.free > 0 {
                state.free -= 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let seq = state.next_seq;
                state.next_seq += 1;
                state.queue.push(Waiter {
                    level: priority.level(),
                    seq,
                    enqueued_at: Instant::now(),
                    tx,
                });
                Some(rx)
            }
        };

        if let Some(rx) = rx {
            // The sender is only dropped if the scheduler itself goes away.
            let _ = rx.await;
        }
        Permit {
            bounded: Some(Arc::clone(bounded)),
        }
    }
}

/// An admission slot. Dropping it hands the slot to the best waiter.
pub struct Permit {
    bounded: Option<Arc<Bounded>>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(bounded) = &self.bounded {
            bounded.release();
        }
    }
}

struct Bounded {
    state: Mutex<BoundedState>,
    starvation_timeout: Duration,
}

struct BoundedState {
    free: usize,
    queue: Vec<Waiter>,
    next_seq: u64,
}

struct Waiter {
    level: i32,
    seq: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<()>,
}

impl Bounded {
    fn release(&self) {
        let mut state = self.state.lock();
        loop {
            let Some(index) = self.pick(&state.queue) else {
                state.free += 1;
                return;
            };
            let waiter = state.queue.swap_remove(index);
            // A waiter whose admit future was dropped takes no slot; try
            // the next one.
            if waiter.tx.send(()).is_ok() {
                return;
            }
        }
    }

    /// Index of the best waiter: highest effective level, then FIFO. Waiters
    /// past the starvation timeout count as Critical.
    fn pick(&self, queue: &[Waiter]) -> Option<usize> {
        let now = Instant::now();
        let effective = |waiter: &Waiter| -> i32 {
            if now.duration_since(waiter.enqueued_at) >= self.starvation_timeout {
                waiter.level.max(Priority::Critical.level())
            } else {
                waiter.level
            }
        };
        queue
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                effective(a)
                    .cmp(&effective(b))
                    .then(b.seq.cmp(&a.seq))
            })
            .map(|(index, _)| index)
    }
}
