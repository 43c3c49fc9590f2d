//! Dedicated threads for model generation.
//!
//! Generation can run for many seconds and some model ports block outright.
//! The pool keeps that work off the bus worker: callers enqueue a job and await
//! a oneshot completion, so the awaiting task yields instead of occupying the
//! bus runtime.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use futures_util::FutureExt;
use tokio::sync::oneshot;

use super::{Generation, ModelPort, Turn};
use crate::error::ModelError;

const JOBS_PER_WORKER: usize = 4;

struct Job {
    turns: Vec<Turn>,
    reply: oneshot::Sender<Result<Generation, ModelError>>,
}

pub struct GenerationPool {
    job_tx: Mutex<Option<flume::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl GenerationPool {
    /// Start `workers` threads (at least one), each with its own runtime.
    pub fn spawn(model: Arc<dyn ModelPort>, workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let (job_tx, job_rx) = flume::bounded::<Job>(workers * JOBS_PER_WORKER);

        let mut handles = Vec::with_capacity(workers);
        for index in 0..workers {
            let model = model.clone();
            let job_rx = job_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("kurisu-generate-{}", index))
                .spawn(move || run_worker(index, model, job_rx))
                .with_context(|| format!("failed to spawn generation worker {}", index))?;
            handles.push(handle);
        }

        tracing::info!("Generation pool started with {} worker(s)", workers);
        Ok(Self {
            job_tx: Mutex::new(Some(job_tx)),
            workers: Mutex::new(handles),
        })
    }

    /// Queue a generation and wait for its result without blocking the caller's thread.
    pub async fn generate(&self, turns: Vec<Turn>) -> Result<Generation, ModelError> {
        let job_tx = self
            .job_tx
            .lock()
            .map_err(|_| ModelError::WorkerUnavailable("generation pool lock poisoned".into()))?
            .clone()
            .ok_or_else(|| ModelError::WorkerUnavailable("generation pool is shut down".into()))?;

        let (reply, done) = oneshot::channel();
        job_tx
            .send_async(Job { turns, reply })
            .await
            .map_err(|_| ModelError::WorkerUnavailable("generation pool is shut down".into()))?;

        done.await.map_err(|_| {
            ModelError::WorkerUnavailable("generation worker exited before replying".into())
        })?
    }

    /// Stop accepting jobs, let queued ones finish, and join the workers.
    pub fn shutdown(&self) {
        if let Ok(mut job_tx) = self.job_tx.lock() {
            job_tx.take();
        }
        let handles = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("Generation worker panicked");
            }
        }
        tracing::info!("Generation pool stopped");
    }
}

fn run_worker(index: usize, model: Arc<dyn ModelPort>, job_rx: flume::Receiver<Job>) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Generation worker {} failed to build runtime: {}", index, e);
            return;
        }
    };

    while let Ok(job) = job_rx.recv() {
        tracing::debug!(
            "Generation worker {} picked up a job ({} turns)",
            index,
            job.turns.len()
        );
        // A panicking model fails the job, not the worker.
        let result = rt
            .block_on(AssertUnwindSafe(model.generate(&job.turns)).catch_unwind())
            .unwrap_or_else(|_| {
                tracing::error!("Generation worker {}: model panicked", index);
                Err(ModelError::Panicked)
            });
        if job.reply.send(result).is_err() {
            tracing::debug!(
                "Generation worker {}: requester went away before the result arrived",
                index
            );
        }
    }
    tracing::debug!("Generation worker {} exiting", index);
}
