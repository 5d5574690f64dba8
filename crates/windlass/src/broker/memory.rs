//! In-memory broker for tests and single-process workers.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Notify;

use super::{Broker, Delivery, Queue, Task};
use crate::clock::Clock;
use crate::error::Result;

#[derive(Debug, Clone)]
struct Message {
    task: Task,
    attempt: u32,
}

#[derive(Debug)]
struct Inflight {
    message: Message,
    redeliver_at: OffsetDateTime,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    /// `(visible_at, message)`, unsorted; promoted on every dequeue.
    delayed: Vec<(OffsetDateTime, Message)>,
    inflight: HashMap<u64, Inflight>,
}

struct Inner {
    workflow: QueueState,
    step: QueueState,
    next_receipt: u64,
}

/// In-memory broker with delayed delivery and a visibility timeout.
///
/// Unacknowledged deliveries reappear after `visibility_timeout`, modelling
/// at-least-once redelivery after a worker crash. Cloning shares the queues.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
    clock: Arc<dyn Clock>,
    visibility_timeout: Duration,
}

impl InMemoryBroker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_visibility_timeout(clock, Duration::from_secs(300))
    }

    /// Override the redelivery window for crash tests.
    pub fn with_visibility_timeout(clock: Arc<dyn Clock>, visibility_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                workflow: QueueState::default(),
                step: QueueState::default(),
                next_receipt: 1,
            })),
            notify: Arc::new(Notify::new()),
            clock,
            visibility_timeout,
        }
    }

    /// Messages currently visible or pending on a queue (test helper).
    pub fn depth(&self, queue: Queue) -> usize {
        let inner = self.lock();
        let state = match queue {
            Queue::Workflow => &inner.workflow,
            Queue::Step => &inner.step,
        };
        state.ready.len() + state.delayed.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("broker lock poisoned")
    }

    /// Move due delayed messages and expired in-flight deliveries back to
    /// ready, then pop the head.
    fn try_pop(&self, queue: Queue, now: OffsetDateTime) -> Option<Delivery> {
        let mut inner = self.lock();
        let next_receipt = &mut inner.next_receipt;
        let receipt = *next_receipt;

        let state = match queue {
            Queue::Workflow => &mut inner.workflow,
            Queue::Step => &mut inner.step,
        };

        let mut idx = 0;
        while idx < state.delayed.len() {
            if state.delayed[idx].0 <= now {
                let (_, message) = state.delayed.swap_remove(idx);
                state.ready.push_back(message);
            } else {
                idx += 1;
            }
        }

        let expired: Vec<u64> = state
            .inflight
            .iter()
            .filter(|(_, inflight)| inflight.redeliver_at <= now)
            .map(|(receipt, _)| *receipt)
            .collect();
        for receipt in expired {
            if let Some(inflight) = state.inflight.remove(&receipt) {
                state.ready.push_back(inflight.message);
            }
        }

        let mut message = state.ready.pop_front()?;
        message.attempt += 1;
        inner.next_receipt += 1;

        let state = match queue {
            Queue::Workflow => &mut inner.workflow,
            Queue::Step => &mut inner.step,
        };
        state.inflight.insert(
            receipt,
            Inflight {
                message: message.clone(),
                redeliver_at: now + self.visibility_timeout,
            },
        );

        Some(Delivery {
            task: message.task,
            receipt,
            attempt: message.attempt,
        })
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(&self, task: Task, delay: Option<Duration>) -> Result<()> {
        let queue = task.queue();
        let message = Message { task, attempt: 0 };
        {
            let mut inner = self.lock();
            let state = match queue {
                Queue::Workflow => &mut inner.workflow,
                Queue::Step => &mut inner.step,
            };
            match delay {
                Some(delay) if !delay.is_zero() => {
                    let visible_at = self.clock.now() + delay;
                    state.delayed.push((visible_at, message));
                }
                _ => state.ready.push_back(message),
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self, queue: Queue, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(delivery) = self.try_pop(queue, self.clock.now()) {
                return Ok(Some(delivery));
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            // Delayed visibility is driven by the injected clock, so poll
            // with a bound rather than sleeping the full window.
            let nap = remaining.min(Duration::from_millis(25));
            let _ = tokio::time::timeout(nap, self.notify.notified()).await;
        }
    }

    async fn ack(&self, queue: Queue, receipt: u64) -> Result<()> {
        let mut inner = self.lock();
        let state = match queue {
            Queue::Workflow => &mut inner.workflow,
            Queue::Step => &mut inner.step,
        };
        state.inflight.remove(&receipt);
        Ok(())
    }

    async fn nack(&self, queue: Queue, receipt: u64, delay: Duration) -> Result<()> {
        let redelivery = {
            let mut inner = self.lock();
            let state = match queue {
                Queue::Workflow => &mut inner.workflow,
                Queue::Step => &mut inner.step,
            };
            state.inflight.remove(&receipt).map(|inflight| {
                let visible_at = self.clock.now() + delay;
                state.delayed.push((visible_at, inflight.message));
                visible_at
            })
        };
        if redelivery.is_some() {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn cancel_steps(&self, run_id: &str) -> Result<u64> {
        let mut inner = self.lock();
        let state = &mut inner.step;
        let matches = |task: &Task| matches!(task, Task::RunStep { run_id: r, .. } if r == run_id);

        let before = state.ready.len() + state.delayed.len();
        state.ready.retain(|m| !matches(&m.task));
        state.delayed.retain(|(_, m)| !matches(&m.task));
        Ok((before - state.ready.len() - state.delayed.len()) as u64)
    }
}
