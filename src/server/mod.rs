use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{PersistenceConfig, ServerConfig};
use crate::export::api;
use crate::export::health::HealthMetrics;
use crate::parser::RecordKind;
use crate::persist::autosave::{AutoSave, PersistOutcome};
use crate::persist::session::{import_session, SessionWriter};
use crate::store::aggregator::{Applied, IngestError, RunAggregator, SharedAggregator};
use crate::store::run::RunId;
use crate::transport::listener::TransportListener;
use crate::transport::message::{DataRecord, Message};

/// Server orchestrates the transport listener, the ingest task, the run
/// store and the health/API HTTP server.
pub struct Server {
    cfg: ServerConfig,
    health: Arc<HealthMetrics>,
    store: SharedAggregator,
    autosave: Option<AutoSave>,
    local_addr: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Server {
    /// Creates a new Server, importing the configured session if any.
    pub fn new(cfg: ServerConfig) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let (aggregator, autosave) = build_store(&cfg.persistence)?;

        Ok(Self {
            cfg,
            health,
            store: aggregator.into_shared(),
            autosave: Some(autosave),
            local_addr: None,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Handle to the run store for readers.
    pub fn store(&self) -> SharedAggregator {
        Arc::clone(&self.store)
    }

    pub fn health(&self) -> Arc<HealthMetrics> {
        Arc::clone(&self.health)
    }

    /// Address the transport listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Start all components and begin accepting agents.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health metrics and read API.
        if self.cfg.health.enabled {
            self.health
                .start(Some(api::router(self.store())))
                .await
                .context("starting health metrics server")?;
        }

        // 2. Ingestion queue and its single consumer.
        let (tx, rx) = mpsc::channel(self.cfg.queue_size);
        self.health.queue_capacity.set(self.cfg.queue_size as f64);
        let autosave = self.autosave.take().unwrap_or_default();
        let persistence = autosave.enabled();
        self.tasks.push(tokio::spawn(run_ingest(
            self.store(),
            rx,
            autosave,
            Some(self.health()),
        )));

        // 3. Transport listener feeding the queue.
        let listener = TransportListener::bind(&self.cfg.bind_addr(), self.cfg.max_frame_length)
            .await?
            .with_health(self.health());
        self.local_addr = Some(listener.local_addr()?);

        let cancel = self.cancel.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = listener.run(tx, cancel).await {
                error!(error = %e, "transport listener failed");
            }
        }));

        self.spawn_stats_reporter();

        info!(
            addr = ?self.local_addr,
            persistence,
            "server fully started",
        );

        Ok(())
    }

    /// Stop accepting agents, drain the ingestion queue and shut down.
    pub async fn stop(&mut self) -> Result<()> {
        info!("stopping server");
        self.cancel.cancel();

        // The ingest task ends once every reader has dropped its sender.
        for handle in self.tasks.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "server task panicked");
            }
        }

        self.health
            .stop()
            .await
            .context("stopping health metrics server")?;

        let store = self.store.read();
        if let Some(run) = store.current_run() {
            warn!(run_id = run.id(), "server stopped while a run was live, it was not saved");
        }
        info!(runs = store.list_runs().len(), "server stopped");

        Ok(())
    }

    fn spawn_stats_reporter(&mut self) {
        let store = self.store();
        let cancel = self.cancel.clone();

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let store = store.read();
                        let live = store.current_run().map(|r| r.id());
                        info!(
                            runs = store.list_runs().len(),
                            live = ?live,
                            dropped = store.dropped_records(),
                            "store stats (60s)",
                        );
                    }
                }
            }
        }));
    }
}

/// Build the aggregator, with any imported session loaded, and the auto-save
/// for new runs.
///
/// An imported session is extended with new runs; otherwise new runs go to
/// a fresh `session.<epoch>` directory under `save_path`.
pub fn build_store(cfg: &PersistenceConfig) -> Result<(RunAggregator, AutoSave)> {
    let mut aggregator = RunAggregator::new();
    let mut autosave = AutoSave::default();

    if let Some(dir) = &cfg.import_path {
        let runs = import_session(dir)
            .with_context(|| format!("importing session {}", dir.display()))?;
        info!(dir = %dir.display(), runs = runs.len(), "imported session");
        aggregator.import(runs);

        if cfg.enabled {
            let writer = SessionWriter::open(dir)
                .with_context(|| format!("opening session {}", dir.display()))?;
            autosave = AutoSave::new(writer);
        }
    } else if cfg.enabled {
        let writer = SessionWriter::new(&cfg.save_path);
        info!(dir = %writer.dir().display(), "auto-save enabled");
        autosave = AutoSave::new(writer);
    }

    Ok((aggregator, autosave))
}

/// Pop messages off the ingestion queue and apply them to the store.
///
/// This is the only writer of the store. Finalized runs are saved through
/// `autosave` before the next message is applied. Returns once every sender
/// is gone and the queue is drained.
pub async fn run_ingest(
    store: SharedAggregator,
    mut rx: mpsc::Receiver<Message>,
    mut autosave: AutoSave,
    health: Option<Arc<HealthMetrics>>,
) {
    let mut applied: u64 = 0;

    while let Some(msg) = rx.recv().await {
        if let Some(h) = &health {
            h.queue_depth.set(rx.len() as f64);
        }
        if let Ok(Applied::RunFinalized(id)) = apply_message(&store, msg, health.as_deref()) {
            autosave = save_finalized(&store, id, autosave, health.as_deref()).await;
        }
        applied += 1;
    }

    info!(messages = applied, "ingest task stopped");
}

/// Apply one message under the write lock and account the outcome.
pub fn apply_message(
    store: &SharedAggregator,
    msg: Message,
    health: Option<&HealthMetrics>,
) -> Result<Applied, IngestError> {
    if let (Some(h), Message::RegularData(records)) = (health, &msg) {
        for record in records {
            h.lines_classified
                .with_label_values(&[data_record_kind(record).as_str()])
                .inc();
        }
    }

    let started = Instant::now();
    let result = store.write().handle(msg);
    if let Some(h) = health {
        h.ingest_duration.observe(started.elapsed().as_secs_f64());
    }

    match &result {
        Ok(applied) => record_applied(*applied, health),
        Err(e) => record_ingest_error(e, health),
    }
    result
}

/// Export a finalized run on the blocking pool.
///
/// Only a read lock is held while the files are written, so API readers
/// are not held up. The ingest task waits, which keeps run exports in order.
pub async fn save_finalized(
    store: &SharedAggregator,
    id: RunId,
    mut autosave: AutoSave,
    health: Option<&HealthMetrics>,
) -> AutoSave {
    if !autosave.enabled() {
        return autosave;
    }

    let store = Arc::clone(store);
    let joined = tokio::task::spawn_blocking(move || {
        let guard = store.read();
        let outcome = match guard.run(id) {
            Some(run) => autosave.save(run),
            None => PersistOutcome::Disabled,
        };
        drop(guard);
        (autosave, outcome)
    })
    .await;

    let (autosave, outcome) = match joined {
        Ok(done) => done,
        Err(e) => {
            error!(run_id = id, error = %e, "saving run panicked, auto-save disabled");
            (AutoSave::default(), PersistOutcome::Failed)
        }
    };

    if let Some(h) = health {
        match outcome {
            PersistOutcome::Saved => h.runs_saved.inc(),
            PersistOutcome::Failed => h.persistence_errors.inc(),
            PersistOutcome::Disabled => {}
        }
    }
    debug!(run_id = id, persist = ?outcome, "finalized run exported");

    autosave
}

fn data_record_kind(record: &DataRecord) -> RecordKind {
    match record {
        DataRecord::CounterSample(_) => RecordKind::CounterSample,
        DataRecord::TaskEvent(_) => RecordKind::TaskEvent,
        DataRecord::PlainLine(_) => RecordKind::PlainLine,
    }
}

fn record_applied(applied: Applied, health: Option<&HealthMetrics>) {
    match applied {
        Applied::RunStarted(_) => {
            if let Some(h) = health {
                h.runs_started.inc();
                h.run_live.set(1.0);
            }
        }
        Applied::RunFinalized(id) => {
            if let Some(h) = health {
                h.runs_finalized.inc();
                h.run_live.set(0.0);
            }
            debug!(run_id = id, "finalize applied");
        }
        Applied::Records { stored } => debug!(stored, "records stored"),
        Applied::CounterInfos { count } => debug!(count, "counter descriptions stored"),
    }
}

fn record_ingest_error(e: &IngestError, health: Option<&HealthMetrics>) {
    if let Some(h) = health {
        h.ingest_errors.with_label_values(&[e.as_label()]).inc();
        if let IngestError::NoActiveRun { records } = e {
            h.records_dropped.inc_by(*records as f64);
        }
    }
    warn!(error = %e, "message rejected");
}
