use std::sync::Arc;

use tokio::{
    sync::{Mutex, broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    error::{PipelineError, Result},
    orchestrator::Orchestrator,
    types::Difficulty,
};

/// Fixed set of workers running queued jobs, at most one job per worker at a time.
pub struct WorkerPool {
    orchestrator: Arc<Orchestrator>,
    queue: mpsc::UnboundedSender<String>,
    shutdown: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(orchestrator: Arc<Orchestrator>, workers: usize) -> Self {
        let (queue, rx) = mpsc::unbounded_channel::<String>();
        let rx = Arc::new(Mutex::new(rx));
        let (shutdown, _) = broadcast::channel(1);

        let handles = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    Arc::clone(&orchestrator),
                    Arc::clone(&rx),
                    shutdown.subscribe(),
                ))
            })
            .collect();
        info!(workers, "Worker pool started");

        Self {
            orchestrator,
            queue,
            shutdown,
            handles,
        }
    }

    /// Submits a video and queues its job.
    pub async fn submit(&self, source_url: &str, difficulty: Option<Difficulty>) -> Result<String> {
        let video_id = self
            .orchestrator
            .submit_video(source_url, difficulty)
            .await?;
        self.enqueue(&video_id)?;
        Ok(video_id)
    }

    /// Requeues a failed job and hands it to the workers.
    pub async fn retry(&self, video_id: &str) -> Result<()> {
        self.orchestrator.requeue(video_id).await?;
        self.enqueue(video_id)
    }

    pub fn enqueue(&self, video_id: &str) -> Result<()> {
        self.queue
            .send(video_id.to_string())
            .map_err(|_| PipelineError::Config("worker pool is shut down".to_string()))
    }

    /// Stops taking new work once the queue is empty and waits for the workers to finish.
    pub async fn drain(self) {
        let Self {
            queue,
            handles,
            shutdown,
            ..
        } = self;
        drop(queue);
        join_all(handles).await;
        drop(shutdown);
    }

    /// Stops the workers as soon as their current job finishes; queued jobs stay queued.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        join_all(self.handles).await;
    }
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Worker task panicked");
        }
    }
}

async fn run_worker(
    worker: usize,
    orchestrator: Arc<Orchestrator>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.recv() => None,
            video_id = async { rx.lock().await.recv().await } => video_id,
        };
        let Some(video_id) = next else {
            debug!(worker, "Worker stopping");
            return;
        };

        match orchestrator.run_job(&video_id).await {
            Ok(job) => debug!(
                worker,
                video_id = video_id.as_str(),
                status = %job.status,
                "Job run finished"
            ),
            Err(e) => warn!(
                worker,
                video_id = video_id.as_str(),
                error = %e,
                "Job run ended with error"
            ),
        }
    }
}
