//! Tick loop and worker pool.
//!
//! Every tick walks tenants and their poller integrations, decides which
//! pollers are due and hands `PollTask`s to a bounded queue drained by a fixed
//! pool of workers. The tick itself never performs poll I/O unless the
//! scheduler runs in synchronous mode.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::engine::poller::{PollExecutor, PollTask};
use crate::engine::retention::RetentionSweeper;
use crate::engine::storage::RemediationStore;
use crate::models::Id;
use crate::Result;

/// A poller is due when it never ran or its interval has elapsed.
pub fn is_due(last: Option<Instant>, now: Instant, interval: Duration) -> bool {
    match last {
        None => true,
        Some(last) => now.saturating_duration_since(last) >= interval,
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub due: usize,
    pub queued: usize,
    /// Tasks lost because the queue was full
    pub dropped: usize,
    pub ran_inline: usize,
}

pub struct Scheduler {
    store: Arc<dyn RemediationStore>,
    poller: Arc<PollExecutor>,
    sweeper: Arc<RetentionSweeper>,
    config: SchedulerConfig,
    last_dispatch: Mutex<HashMap<(Id, Id), Instant>>,
    queue: mpsc::Sender<PollTask>,
    receiver: Mutex<Option<mpsc::Receiver<PollTask>>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn RemediationStore>,
        poller: Arc<PollExecutor>,
        sweeper: Arc<RetentionSweeper>,
        config: SchedulerConfig,
    ) -> Self {
        let (queue, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            store,
            poller,
            sweeper,
            config,
            last_dispatch: Mutex::new(HashMap::new()),
            queue,
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Select due pollers and dispatch them, as of `Instant::now()`.
    pub async fn tick(&self) -> Result<TickSummary> {
        self.tick_at(Instant::now()).await
    }

    pub async fn tick_at(&self, now: Instant) -> Result<TickSummary> {
        let mut summary = TickSummary::default();
        let default_interval = Duration::from_secs(self.config.default_poll_interval_secs);

        for tenant in self.store.list_tenants().await? {
            if !tenant.is_active() {
                continue;
            }
            let pollers = match self.store.list_pollers(tenant.id, &self.config.poller_marker).await {
                Ok(pollers) => pollers,
                Err(e) => {
                    error!(tenant_id = tenant.id, "Failed to list pollers: {}", e);
                    continue;
                }
            };

            for poller in pollers {
                let workflows = match self.store.workflows_for_poller(tenant.id, poller.id).await {
                    Ok(workflows) => workflows,
                    Err(e) => {
                        error!(tenant_id = tenant.id, integration = %poller.name, "Failed to load workflows: {}", e);
                        continue;
                    }
                };
                if workflows.is_empty() {
                    continue;
                }

                let key = (tenant.id, poller.id);
                {
                    let mut last_dispatch = self.last_dispatch.lock().await;
                    if !is_due(last_dispatch.get(&key).copied(), now, poller.poll_interval(default_interval)) {
                        continue;
                    }
                    last_dispatch.insert(key, now);
                }
                summary.due += 1;

                let task = PollTask {
                    tenant_id: tenant.id,
                    poller,
                    workflows,
                };

                if self.config.synchronous {
                    self.run_task(task).await;
                    summary.ran_inline += 1;
                    continue;
                }

                match self.queue.try_send(task) {
                    Ok(()) => summary.queued += 1,
                    Err(mpsc::error::TrySendError::Full(task)) => {
                        warn!(
                            tenant_id = task.tenant_id,
                            integration = %task.poller.name,
                            "Poll queue full, dropping task"
                        );
                        summary.dropped += 1;
                    }
                    Err(mpsc::error::TrySendError::Closed(task)) => {
                        warn!(
                            tenant_id = task.tenant_id,
                            integration = %task.poller.name,
                            "Poll queue closed, dropping task"
                        );
                        summary.dropped += 1;
                    }
                }
            }
        }

        if summary.due > 0 {
            debug!(?summary, "Scheduler tick");
        }
        Ok(summary)
    }

    /// Run one poll in its own task so a panic is contained and logged.
    async fn run_task(&self, task: PollTask) {
        let poller = self.poller.clone();
        let tenant_id = task.tenant_id;
        let name = task.poller.name.clone();

        match tokio::spawn(async move { poller.run(task).await }).await {
            Ok(Ok(summary)) => debug!(tenant_id, integration = %name, ?summary, "Poll finished"),
            Ok(Err(e)) => error!(tenant_id, integration = %name, "Poll failed: {}", e),
            Err(e) if e.is_panic() => error!(tenant_id, integration = %name, "Poll worker panicked: {}", e),
            Err(e) => warn!(tenant_id, integration = %name, "Poll cancelled: {}", e),
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let stale = self.store.fail_running_jobs().await?;
        if stale > 0 {
            warn!("Marked {} interrupted job(s) as failed", stale);
        }

        let mut workers = Vec::new();
        if let Some(receiver) = self.receiver.lock().await.take() {
            let receiver = Arc::new(Mutex::new(receiver));
            let count = self.config.worker_count.max(1);
            for worker_id in 0..count {
                workers.push(tokio::spawn(Self::worker(
                    self.clone(),
                    worker_id,
                    receiver.clone(),
                    shutdown.clone(),
                )));
            }
            info!("Started {} poll worker(s)", count);
        } else if !self.config.synchronous {
            warn!("Scheduler workers already started; running the tick loop only");
        }

        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let retention_period = self.config.retention_interval();
        let mut retention = tokio::time::interval_at(Instant::now() + retention_period, retention_period);
        retention.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Scheduler started (tick {:?}, {} worker(s), queue {})",
            self.config.tick_interval(),
            self.config.worker_count,
            self.config.queue_capacity
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        error!("Scheduler tick failed: {}", e);
                    }
                }
                _ = retention.tick() => self.sweeper.run_logged().await,
            }
        }

        info!("Scheduler stopping, waiting for workers");
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                error!("Worker exited abnormally: {}", e);
            }
        }
        Ok(())
    }

    async fn worker(
        self: Arc<Self>,
        worker_id: usize,
        receiver: Arc<Mutex<mpsc::Receiver<PollTask>>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => None,
                task = async { receiver.lock().await.recv().await } => task,
            };
            match next {
                Some(task) => self.run_task(task).await,
                None => break,
            }
        }
        debug!(worker_id, "Poll worker stopped");
    }
}
