//! Result delivery from the scheduling thread to waiting transport threads.
//!
//! Results are looked up by task id, never by queue position, so unrelated
//! tasks may complete in any order. A result for an id with no registered
//! waiter is dropped. Multi-prompt requests register a multitask whose
//! sub-results are aggregated here and delivered as one merged result in
//! original submission order.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use log::debug;

use crate::task::{ResultPayload, TaskResult};
use crate::TaskId;

/// Receive failure: the bus was shut down while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("result bus terminated")]
pub struct BusClosed;

#[derive(Debug)]
struct MultiTask {
    /// Subtask ids in submission order; aggregation preserves this order.
    subtasks: Vec<TaskId>,
    remaining: HashSet<TaskId>,
    collected: HashMap<TaskId, ResultPayload>,
}

#[derive(Default)]
struct BusState {
    waiting: HashSet<TaskId>,
    results: VecDeque<TaskResult>,
    multitasks: HashMap<TaskId, MultiTask>,
    // subtask id -> owning multitask id
    subtask_owner: HashMap<TaskId, TaskId>,
    closed: bool,
}

#[derive(Default)]
pub struct ResultBus {
    state: Mutex<BusState>,
    cond: Condvar,
}

impl ResultBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest before posting the generating task; results arriving
    /// for unregistered ids are dropped.
    pub fn add_waiting_task_id(&self, id: TaskId) {
        self.state.lock().unwrap().waiting.insert(id);
    }

    /// Unregister and drop any buffered results for the id.
    pub fn remove_waiting_task_id(&self, id: TaskId) {
        let mut state = self.state.lock().unwrap();
        state.waiting.remove(&id);
        state.results.retain(|r| r.task_id != id);
    }

    /// Split one caller request into subtasks aggregated under `multitask_id`.
    /// Subtask ids must be disjoint from every other registered multitask.
    pub fn register_multitask(&self, multitask_id: TaskId, subtasks: Vec<TaskId>) {
        let mut state = self.state.lock().unwrap();
        for &sub in &subtasks {
            let prev = state.subtask_owner.insert(sub, multitask_id);
            debug_assert!(prev.is_none(), "subtask id registered twice");
        }
        state.multitasks.insert(
            multitask_id,
            MultiTask {
                remaining: subtasks.iter().copied().collect(),
                subtasks,
                collected: HashMap::new(),
            },
        );
    }

    /// Deliver a result. Subtask terminals feed multitask aggregation;
    /// subtask partials are forwarded to the multitask's waiters; everything
    /// else goes to the exact matching task id.
    pub fn send(&self, result: TaskResult) {
        let mut state = self.state.lock().unwrap();

        if let Some(&owner) = state.subtask_owner.get(&result.task_id) {
            if result.is_terminal() {
                let mt = state.multitasks.get_mut(&owner).expect("owner registered");
                mt.remaining.remove(&result.task_id);
                mt.collected.insert(result.task_id, result.payload);
            } else if state.waiting.contains(&owner) {
                state.results.push_back(TaskResult {
                    task_id: owner,
                    payload: result.payload,
                });
                self.cond.notify_all();
            }
            return;
        }

        if state.waiting.contains(&result.task_id) {
            debug!("result for task id={} queued", result.task_id);
            state.results.push_back(result);
            self.cond.notify_all();
        } else {
            debug!("dropping result for unregistered task id={}", result.task_id);
        }
    }

    /// Merge and deliver every multitask whose subtasks have all completed.
    /// Called from the scheduling thread after each queue drain.
    pub fn resolve_multitasks(&self) {
        let mut state = self.state.lock().unwrap();
        let finished: Vec<TaskId> = state
            .multitasks
            .iter()
            .filter(|(_, mt)| mt.remaining.is_empty())
            .map(|(&id, _)| id)
            .collect();

        for id in finished {
            let mut mt = state.multitasks.remove(&id).unwrap();
            let merged: Vec<ResultPayload> = mt
                .subtasks
                .iter()
                .map(|sub| {
                    state.subtask_owner.remove(sub);
                    mt.collected.remove(sub).expect("terminal collected")
                })
                .collect();
            if state.waiting.contains(&id) {
                state.results.push_back(TaskResult {
                    task_id: id,
                    payload: ResultPayload::Batch(merged),
                });
                self.cond.notify_all();
            }
        }
    }

    /// Block until a result for `id` arrives.
    pub fn recv(&self, id: TaskId) -> Result<TaskResult, BusClosed> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(BusClosed);
            }
            if let Some(pos) = state.results.iter().position(|r| r.task_id == id) {
                return Ok(state.results.remove(pos).unwrap());
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Like `recv`, but gives up after `timeout`, returning `Ok(None)`.
    pub fn recv_timeout(
        &self,
        id: TaskId,
        timeout: Duration,
    ) -> Result<Option<TaskResult>, BusClosed> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(BusClosed);
            }
            if let Some(pos) = state.results.iter().position(|r| r.task_id == id) {
                return Ok(state.results.remove(pos));
            }
            let (next, wait) = self.cond.wait_timeout(state, timeout).unwrap();
            state = next;
            if wait.timed_out() {
                return Ok(None);
            }
        }
    }

    /// Invoke `on_result` per result for `id` until a terminal result is seen
    /// or the callback returns false (caller requested termination). Returns
    /// false when the callback cut the stream short.
    pub fn recv_stream(
        &self,
        id: TaskId,
        mut on_result: impl FnMut(TaskResult) -> bool,
    ) -> Result<bool, BusClosed> {
        loop {
            let result = self.recv(id)?;
            let terminal = result.is_terminal();
            if !on_result(result) {
                return Ok(false);
            }
            if terminal {
                return Ok(true);
            }
        }
    }

    pub fn terminate(&self) {
        self.state.lock().unwrap().closed = true;
        self.cond.notify_all();
    }
}
