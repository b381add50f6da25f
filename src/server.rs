//! Caller-facing server handle.
//!
//! Owns the dedicated scheduling thread (task-queue consumer loop + engine)
//! and exposes the submit/cancel/stream/metrics surface used by transport
//! layers. All methods here are safe to call from any thread; none of them
//! touch slot or KV state directly.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Result;
use log::info;

use crate::backend::ComputeBackend;
use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::metrics::MetricsReport;
use crate::queue::TaskQueue;
use crate::results::{BusClosed, ResultBus};
use crate::task::{
    GenerationParams, InferenceKind, InferenceTask, ResultPayload, Task, TaskKind, TaskResult,
};
use crate::tokenizer::TextCodec;
use crate::{TaskId, Token};

/// Two-phase lifecycle observed by both the scheduling thread and the
/// transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Ready,
    ShuttingDown,
}

#[derive(Debug)]
pub struct LifecycleGate(AtomicU8);

impl LifecycleGate {
    fn new() -> Self {
        Self(AtomicU8::new(Lifecycle::Uninitialized as u8))
    }

    fn set(&self, state: Lifecycle) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    pub fn get(&self) -> Lifecycle {
        match self.0.load(Ordering::SeqCst) {
            0 => Lifecycle::Uninitialized,
            1 => Lifecycle::Ready,
            _ => Lifecycle::ShuttingDown,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.get() == Lifecycle::Ready
    }
}

pub struct Server {
    queue: Arc<TaskQueue>,
    results: Arc<ResultBus>,
    codec: Arc<dyn TextCodec>,
    lifecycle: Arc<LifecycleGate>,
    scheduler: Option<JoinHandle<()>>,
}

impl Server {
    /// Assemble the engine and spawn the scheduling thread. The server is
    /// `Ready` when this returns.
    pub fn start(
        config: EngineConfig,
        backend: Box<dyn ComputeBackend>,
        codec: Arc<dyn TextCodec>,
    ) -> Result<Self> {
        config.validate()?;

        let queue = Arc::new(TaskQueue::new());
        let results = Arc::new(ResultBus::new());
        let lifecycle = Arc::new(LifecycleGate::new());

        let mut engine = Engine::new(
            config,
            backend,
            codec.clone(),
            queue.clone(),
            results.clone(),
        );

        let loop_queue = queue.clone();
        let scheduler = std::thread::Builder::new()
            .name("scheduler".into())
            .spawn(move || loop_queue.run(&mut engine))?;

        lifecycle.set(Lifecycle::Ready);
        info!("server ready");

        Ok(Self {
            queue,
            results,
            codec,
            lifecycle,
            scheduler: Some(scheduler),
        })
    }

    pub fn lifecycle(&self) -> Arc<LifecycleGate> {
        self.lifecycle.clone()
    }

    pub fn codec(&self) -> Arc<dyn TextCodec> {
        self.codec.clone()
    }

    /// Submit a single inference task; the returned id is registered on the
    /// result bus before the task is posted.
    pub fn submit(&self, task: InferenceTask) -> TaskId {
        let id = self.queue.get_new_id();
        self.results.add_waiting_task_id(id);
        self.queue.post(Task::with_id(id, TaskKind::Inference(task)));
        id
    }

    /// Fan one multi-prompt request out into subtasks plus an aggregating
    /// multitask. Returns the multitask id to wait on.
    pub fn submit_many(
        &self,
        kind: InferenceKind,
        prompts: Vec<Vec<Token>>,
        params: GenerationParams,
    ) -> TaskId {
        let multitask_id = self.queue.get_new_id();
        let sub_ids: Vec<TaskId> = prompts.iter().map(|_| self.queue.get_new_id()).collect();

        self.results.add_waiting_task_id(multitask_id);
        self.results.register_multitask(multitask_id, sub_ids.clone());

        for (index, (prompt, id)) in prompts.into_iter().zip(sub_ids).enumerate() {
            let task = InferenceTask {
                kind,
                prompt: prompt.into(),
                params: params.clone(),
                target_slot: None,
                index,
                multitask_id: Some(multitask_id),
            };
            self.queue.post(Task::with_id(id, TaskKind::Inference(task)));
        }
        multitask_id
    }

    /// Release the slot working on `target` at the next loop iteration; no
    /// further results are delivered for it.
    pub fn cancel(&self, target: TaskId) {
        self.queue.post(Task::new(TaskKind::Cancel { target }));
        self.results.remove_waiting_task_id(target);
    }

    /// Block for the next result of `id`.
    pub fn recv(&self, id: TaskId) -> Result<TaskResult, BusClosed> {
        self.results.recv(id)
    }

    /// Block for the terminal result of `id` and unregister the waiter.
    pub fn recv_final(&self, id: TaskId) -> Result<TaskResult, BusClosed> {
        let result = loop {
            let result = self.results.recv(id)?;
            if result.is_terminal() {
                break result;
            }
        };
        self.results.remove_waiting_task_id(id);
        Ok(result)
    }

    /// Deliver results for `id` to `on_result` until the terminal one or
    /// until the callback returns false; a cut-short stream cancels the task.
    pub fn stream(
        &self,
        id: TaskId,
        on_result: impl FnMut(TaskResult) -> bool,
    ) -> Result<(), BusClosed> {
        let completed = self.results.recv_stream(id, on_result)?;
        if !completed {
            self.cancel(id);
        } else {
            self.results.remove_waiting_task_id(id);
        }
        Ok(())
    }

    /// Aggregate scheduler counters, optionally resetting the bucket values.
    pub fn poll_metrics(&self, reset_bucket: bool) -> Result<MetricsReport> {
        let id = self.queue.get_new_id();
        self.results.add_waiting_task_id(id);
        self.queue
            .post(Task::with_id(id, TaskKind::Metrics { reset_bucket }));
        let result = self.recv_final(id).map_err(|_| anyhow::anyhow!("bus closed"))?;
        match result.payload {
            ResultPayload::Metrics(report) => Ok(*report),
            other => anyhow::bail!("unexpected metrics payload: {:?}", other),
        }
    }

    /// Stage a shared-prefix rebuild; blocks until the scheduler applied it.
    pub fn set_system_prompt(&self, tokens: Vec<Token>) -> Result<usize> {
        let id = self.queue.get_new_id();
        self.results.add_waiting_task_id(id);
        self.queue
            .post(Task::with_id(id, TaskKind::SystemPrompt { tokens }));
        let result = self.recv_final(id).map_err(|_| anyhow::anyhow!("bus closed"))?;
        match result.payload {
            ResultPayload::SystemPromptSet { n_tokens } => Ok(n_tokens),
            ResultPayload::Error(e) => anyhow::bail!("{}", e.message),
            other => anyhow::bail!("unexpected payload: {:?}", other),
        }
    }

    /// Stop the scheduling thread and unblock every waiter.
    pub fn shutdown(&mut self) {
        if self.lifecycle.get() == Lifecycle::ShuttingDown {
            return;
        }
        info!("shutting down scheduler");
        self.lifecycle.set(Lifecycle::ShuttingDown);
        self.queue.terminate();
        self.results.terminate();
        if let Some(handle) = self.scheduler.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}
