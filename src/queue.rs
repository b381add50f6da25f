//! Producer/consumer task queue.
//!
//! Any thread may post; a single dedicated scheduling thread drains the queue
//! and drives the engine. Tasks that cannot be scheduled yet (no free slot)
//! sit in a deferred side queue until a slot transition re-queues them.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use log::debug;

use crate::task::{Task, TaskKind};
use crate::TaskId;

/// Callbacks driven by the consumer loop, implemented by the engine.
pub trait QueueHandler {
    /// Process one dequeued task. An error is converted into an error result
    /// for that task by `on_task_error`; the loop itself keeps running.
    fn on_task(&mut self, task: Task) -> anyhow::Result<()>;

    fn on_task_error(&mut self, task_id: Option<TaskId>, err: anyhow::Error);

    /// Invoked after the queue has been fully drained; this is where finished
    /// multitasks are resolved and one scheduler tick runs.
    fn on_drained(&mut self);
}

#[derive(Default)]
struct QueueState {
    next_id: TaskId,
    tasks: VecDeque<Task>,
    deferred: VecDeque<Task>,
    running: bool,
}

#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id before constructing the task, so the caller can
    /// register a result waiter first.
    pub fn get_new_id(&self) -> TaskId {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    /// Append to the FIFO and wake the consumer. Assigns an id when the task
    /// does not carry one. Posting a cancel also purges queued work for the
    /// cancelled id from both queues.
    pub fn post(&self, mut task: Task) -> TaskId {
        let mut state = self.state.lock().unwrap();
        let id = match task.id {
            Some(id) => id,
            None => {
                let id = state.next_id;
                state.next_id += 1;
                task.id = Some(id);
                id
            }
        };
        if let TaskKind::Cancel { target } = &task.kind {
            Self::purge_target(&mut state, *target);
        }
        debug!("new task, id={}", id);
        state.tasks.push_back(task);
        self.cond.notify_one();
        id
    }

    /// Park a task until `notify_slot_changed` re-queues it.
    pub fn defer(&self, task: Task) {
        let mut state = self.state.lock().unwrap();
        debug!("defer task, id={:?}", task.id);
        state.deferred.push_back(task);
    }

    /// Move every deferred task to the front of the main queue. Called on any
    /// slot transition to Idle.
    pub fn notify_slot_changed(&self) {
        let mut state = self.state.lock().unwrap();
        while let Some(task) = state.deferred.pop_back() {
            state.tasks.push_front(task);
        }
        self.cond.notify_one();
    }

    pub fn n_deferred(&self) -> usize {
        self.state.lock().unwrap().deferred.len()
    }

    pub fn terminate(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        self.cond.notify_all();
    }

    /// Consumer loop: drain all queued tasks through the handler, signal the
    /// drain point (multitask resolution + scheduler tick), then block until
    /// new work arrives. Returns only after `terminate`.
    pub fn run(&self, handler: &mut dyn QueueHandler) {
        self.state.lock().unwrap().running = true;

        loop {
            loop {
                let task = {
                    let mut state = self.state.lock().unwrap();
                    if !state.running {
                        return;
                    }
                    state.tasks.pop_front()
                };
                let Some(task) = task else { break };

                let id = task.id;
                debug!("processing task, id={:?}", id);
                if let Err(err) = handler.on_task(task) {
                    handler.on_task_error(id, err);
                }
            }

            handler.on_drained();

            let mut state = self.state.lock().unwrap();
            while state.tasks.is_empty() && state.running {
                state = self.cond.wait(state).unwrap();
            }
            if !state.running {
                return;
            }
        }
    }

    fn purge_target(state: &mut QueueState, target: TaskId) {
        let hits = |task: &Task| -> bool {
            if task.id == Some(target) {
                return true;
            }
            matches!(task.kind, TaskKind::Cancel { target: t } if t == target)
        };
        state.tasks.retain(|t| !hits(t));
        state.deferred.retain(|t| !hits(t));
    }
}
