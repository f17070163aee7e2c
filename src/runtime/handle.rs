use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{Mutex, broadcast, mpsc, oneshot},
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    core::store::{EventStore, StoreError, StoreSnapshotV1},
    engine::{ResultEngine, aggregate::ResultRow, config::EngineConfig, projector::ResultProjector},
    entity::{Category, Competitor, CompetitorDraft, CompetitorPatch, Event},
    op::{Op, StoredOp},
    persist::{OpSink, PersistError},
    punch::{Punch, ReadoutBatch},
    types::{CategoryId, CompetitorId, EventId, OpSeq, RaceStatus, SiNumber},
};

use super::events::ResultEvent;

/// Failure of a runtime command.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The store rejected the mutation.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The journal could not accept or write the op.
    #[error(transparent)]
    Persist(#[from] PersistError),
    /// The runtime loop is gone.
    #[error("results service is not running")]
    ChannelClosed,
}

/// Tunables of the results service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Flush the journal as soon as a punch set is replaced.
    pub flush_on_readout: bool,
    /// Ops buffered before a journal write.
    pub batch_max_ops: usize,
    /// Longest time an op waits in the buffer.
    pub batch_max_latency_ms: u64,
    /// Capacity of the persistence queue.
    pub persist_queue_bound: usize,
    /// Write a snapshot after this many ops; 0 disables.
    pub snapshot_every_ops: usize,
    /// Drop journal rows covered by a fresh snapshot.
    pub compact_after_snapshot: bool,
    /// Reconciliation tunables.
    pub engine: EngineConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            flush_on_readout: true,
            batch_max_ops: 32,
            batch_max_latency_ms: 75,
            persist_queue_bound: 64,
            snapshot_every_ops: 2000,
            compact_after_snapshot: false,
            engine: EngineConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parses a JSON config document; missing fields keep their defaults.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Cloneable handle to the single-writer results service.
///
/// A mutation that returns [`RuntimeError::Persist`] was still applied: the
/// store and the published results already reflect it, but the op never
/// reached the journal and is gone after a restart unless a
/// [`checkpoint`](Self::checkpoint) captures it. Do not resend the mutation.
#[derive(Clone)]
pub struct ResultsHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<ResultEvent>,
}

type Reply<T> = oneshot::Sender<Result<T, RuntimeError>>;

enum Command {
    UpsertEvent {
        event: Event,
        resp: Reply<()>,
    },
    UpsertCategory {
        category: Category,
        resp: Reply<()>,
    },
    DeleteEvent {
        id: EventId,
        resp: Reply<()>,
    },
    DeleteCategory {
        id: CategoryId,
        resp: Reply<()>,
    },
    CreateCompetitor {
        draft: CompetitorDraft,
        resp: Reply<CompetitorId>,
    },
    PatchCompetitor {
        id: CompetitorId,
        patch: CompetitorPatch,
        resp: Reply<()>,
    },
    DeleteCompetitor {
        id: CompetitorId,
        resp: Reply<()>,
    },
    AssignReadout {
        batch: ReadoutBatch,
        resp: Reply<CompetitorId>,
    },
    ReplacePunches {
        competitor_id: CompetitorId,
        punches: Vec<Punch>,
        resp: Reply<()>,
    },
    SetManualStatus {
        competitor_id: CompetitorId,
        status: Option<RaceStatus>,
        resp: Reply<()>,
    },
    Results {
        category_id: CategoryId,
        resp: oneshot::Sender<Option<Vec<ResultRow>>>,
    },
    Competitor {
        id: CompetitorId,
        resp: oneshot::Sender<Option<Competitor>>,
    },
    CheckSiCard {
        si_number: SiNumber,
        event_id: EventId,
        resp: oneshot::Sender<bool>,
    },
    Flush {
        resp: Reply<OpSeq>,
    },
    Checkpoint {
        resp: Reply<()>,
    },
    Shutdown {
        resp: Reply<()>,
    },
}

enum PersistMsg {
    Op(StoredOp),
    Flush {
        resp: oneshot::Sender<Result<OpSeq, PersistError>>,
    },
    Checkpoint {
        snapshot: StoreSnapshotV1,
        last_seq: OpSeq,
        compact: bool,
        resp: oneshot::Sender<Result<(), PersistError>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Spawns the results service on the current tokio runtime.
///
/// All mutations go through one task, so a competitor's punches are never
/// validated while another command rewrites them. Results for every stored
/// category are computed before the first command is served.
pub fn spawn_results_service(
    store: EventStore,
    sink: Option<Box<dyn OpSink>>,
    config: RuntimeConfig,
) -> ResultsHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(256);
    let (events_tx, _) = broadcast::channel::<ResultEvent>(1024);

    let (persist_tx, mut durable_rx) = if let Some(sink) = sink {
        let (persist_tx, persist_rx) = mpsc::channel::<PersistMsg>(config.persist_queue_bound.max(1));
        let (durable_tx, durable_rx) = mpsc::unbounded_channel::<Result<OpSeq, PersistError>>();
        spawn_persistence_worker(sink, persist_rx, durable_tx, config.clone());
        (Some(persist_tx), Some(durable_rx))
    } else {
        (None, None)
    };

    let mut writer = Writer {
        projector: ResultProjector::new(ResultEngine::new(config.engine.clone())),
        store,
        events_tx: events_tx.clone(),
        persist_tx,
        config,
        ops_since_snapshot: 0,
    };

    tokio::spawn(async move {
        writer.prime();

        loop {
            if let Some(rx) = durable_rx.as_mut() {
                tokio::select! {
                    cmd = cmd_rx.recv() => {
                        let Some(cmd) = cmd else { break; };
                        if writer.handle(cmd).await {
                            break;
                        }
                    }
                    durable = rx.recv() => {
                        match durable {
                            Some(Ok(op_seq)) => {
                                let _ = writer.events_tx.send(ResultEvent::DurableUpTo { op_seq });
                            }
                            Some(Err(err)) => warn!(%err, "journal write failed"),
                            None => {}
                        }
                    }
                }
            } else {
                let Some(cmd) = cmd_rx.recv().await else { break; };
                if writer.handle(cmd).await {
                    break;
                }
            }
        }
        debug!("results service stopped");
    });

    ResultsHandle { cmd_tx, events_tx }
}

impl ResultsHandle {
    /// Subscribes to the service's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ResultEvent> {
        self.events_tx.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Creates or replaces an event.
    pub async fn upsert_event(&self, event: Event) -> Result<(), RuntimeError> {
        self.request(|resp| Command::UpsertEvent { event, resp }).await?
    }

    /// Creates or replaces a category; an invalid course is rejected.
    pub async fn upsert_category(&self, category: Category) -> Result<(), RuntimeError> {
        self.request(|resp| Command::UpsertCategory { category, resp }).await?
    }

    /// Removes an event with all of its categories and competitors.
    pub async fn delete_event(&self, id: EventId) -> Result<(), RuntimeError> {
        self.request(|resp| Command::DeleteEvent { id, resp }).await?
    }

    /// Removes a category together with its competitors.
    pub async fn delete_category(&self, id: CategoryId) -> Result<(), RuntimeError> {
        self.request(|resp| Command::DeleteCategory { id, resp }).await?
    }

    /// Registers a competitor; its SI card must be unused in the event.
    pub async fn create_competitor(&self, draft: CompetitorDraft) -> Result<CompetitorId, RuntimeError> {
        self.request(|resp| Command::CreateCompetitor { draft, resp }).await?
    }

    /// Patches a competitor's registration.
    pub async fn patch_competitor(&self, id: CompetitorId, patch: CompetitorPatch) -> Result<(), RuntimeError> {
        self.request(|resp| Command::PatchCompetitor { id, patch, resp }).await?
    }

    /// Removes a competitor and its punches.
    pub async fn delete_competitor(&self, id: CompetitorId) -> Result<(), RuntimeError> {
        self.request(|resp| Command::DeleteCompetitor { id, resp }).await?
    }

    /// Binds a card readout to the competitor carrying that card.
    pub async fn assign_readout(&self, batch: ReadoutBatch) -> Result<CompetitorId, RuntimeError> {
        self.request(|resp| Command::AssignReadout { batch, resp }).await?
    }

    /// Replaces a competitor's punch set, e.g. after a manual correction.
    pub async fn replace_punches(&self, competitor_id: CompetitorId, punches: Vec<Punch>) -> Result<(), RuntimeError> {
        self.request(|resp| Command::ReplacePunches {
            competitor_id,
            punches,
            resp,
        })
        .await?
    }

    /// Sets or clears the organizer's status override.
    pub async fn set_manual_status(
        &self,
        competitor_id: CompetitorId,
        status: Option<RaceStatus>,
    ) -> Result<(), RuntimeError> {
        self.request(|resp| Command::SetManualStatus {
            competitor_id,
            status,
            resp,
        })
        .await?
    }

    /// Current ranked rows of a category, if it has a usable course.
    pub async fn results(&self, category_id: CategoryId) -> Result<Option<Vec<ResultRow>>, RuntimeError> {
        self.request(|resp| Command::Results { category_id, resp }).await
    }

    /// Current record of a competitor.
    pub async fn competitor(&self, id: CompetitorId) -> Result<Option<Competitor>, RuntimeError> {
        self.request(|resp| Command::Competitor { id, resp }).await
    }

    /// Returns true when no competitor of the event carries `si_number`.
    pub async fn check_si_card_unique(&self, si_number: SiNumber, event_id: EventId) -> Result<bool, RuntimeError> {
        self.request(|resp| Command::CheckSiCard {
            si_number,
            event_id,
            resp,
        })
        .await
    }

    /// Writes buffered ops and returns the highest durable sequence.
    pub async fn flush(&self) -> Result<OpSeq, RuntimeError> {
        self.request(|resp| Command::Flush { resp }).await?
    }

    /// Writes a snapshot of the current store.
    pub async fn checkpoint(&self) -> Result<(), RuntimeError> {
        self.request(|resp| Command::Checkpoint { resp }).await?
    }

    /// Flushes the journal and stops the service.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.request(|resp| Command::Shutdown { resp }).await?
    }
}

struct Writer {
    store: EventStore,
    projector: ResultProjector,
    events_tx: broadcast::Sender<ResultEvent>,
    persist_tx: Option<mpsc::Sender<PersistMsg>>,
    config: RuntimeConfig,
    ops_since_snapshot: usize,
}

impl Writer {
    fn prime(&mut self) {
        for category_id in self.store.category_ids() {
            if let Err(err) = self.projector.recompute_category(&self.store, category_id) {
                warn!(category_id, %err, "initial results unavailable");
            }
        }
        // Ops committed before the service took over the store.
        let pending = self.store.drain_pending_ops();
        if let Some(tx) = &self.persist_tx {
            for stored in pending.iter().cloned() {
                if let Err(err) = enqueue_persist(tx, stored) {
                    warn!(%err, "op not journaled");
                }
            }
        }
        info!(
            categories = self.store.category_ids().len(),
            pending = pending.len(),
            "results service started"
        );
    }

    /// Returns true once the loop should stop.
    async fn handle(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::UpsertEvent { event, resp } => {
                let res = self.store.upsert_event(event).map(drop);
                let _ = resp.send(self.commit(res));
            }
            Command::UpsertCategory { category, resp } => {
                let res = self.store.upsert_category(category).map(drop);
                let _ = resp.send(self.commit(res));
            }
            Command::DeleteEvent { id, resp } => {
                let res = self.store.delete_event(id).map(drop);
                let _ = resp.send(self.commit(res));
            }
            Command::DeleteCategory { id, resp } => {
                let res = self.store.delete_category(id).map(drop);
                let _ = resp.send(self.commit(res));
            }
            Command::CreateCompetitor { draft, resp } => {
                let res = self.store.insert_competitor(draft).map(|(id, _)| id);
                let res = self.commit(res);
                if let Ok(id) = res {
                    let _ = self.events_tx.send(ResultEvent::CompetitorCreated { id });
                }
                let _ = resp.send(res);
            }
            Command::PatchCompetitor { id, patch, resp } => {
                let res = self.store.patch_competitor(id, patch).map(drop);
                let _ = resp.send(self.commit(res));
            }
            Command::DeleteCompetitor { id, resp } => {
                let res = self.store.delete_competitor(id).map(drop);
                let _ = resp.send(self.commit(res));
            }
            Command::AssignReadout { batch, resp } => {
                let si_number = batch.si_number;
                let res = self.store.assign_readout(batch).map(|(id, _)| id);
                let res = self.commit(res);
                if let Ok(competitor_id) = res {
                    let _ = self.events_tx.send(ResultEvent::ReadoutAssigned {
                        si_number,
                        competitor_id,
                    });
                }
                let _ = resp.send(res);
            }
            Command::ReplacePunches {
                competitor_id,
                punches,
                resp,
            } => {
                let res = self.store.replace_punches(competitor_id, punches).map(drop);
                let _ = resp.send(self.commit(res));
            }
            Command::SetManualStatus {
                competitor_id,
                status,
                resp,
            } => {
                let res = self.store.set_manual_status(competitor_id, status).map(drop);
                let _ = resp.send(self.commit(res));
            }
            Command::Results { category_id, resp } => {
                let _ = resp.send(self.projector.results(category_id).map(<[ResultRow]>::to_vec));
            }
            Command::Competitor { id, resp } => {
                let _ = resp.send(self.store.competitor(id).cloned());
            }
            Command::CheckSiCard {
                si_number,
                event_id,
                resp,
            } => {
                let _ = resp.send(self.store.check_si_card_unique(si_number, event_id));
            }
            Command::Flush { resp } => {
                let out = self.flush().await;
                let _ = resp.send(out);
            }
            Command::Checkpoint { resp } => {
                let out = self.checkpoint().await;
                if out.is_ok() {
                    self.ops_since_snapshot = 0;
                }
                let _ = resp.send(out);
            }
            Command::Shutdown { resp } => {
                let out = if let Some(tx) = &self.persist_tx {
                    let (done_tx, done_rx) = oneshot::channel();
                    if tx.send(PersistMsg::Shutdown { resp: done_tx }).await.is_err() {
                        Err(RuntimeError::ChannelClosed)
                    } else {
                        done_rx.await.map_err(|_| RuntimeError::ChannelClosed)
                    }
                } else {
                    Ok(())
                };
                let _ = resp.send(out);
                return true;
            }
        }

        self.maybe_auto_checkpoint().await;
        false
    }

    /// Projects and journals the ops produced by a store mutation.
    fn commit<T>(&mut self, res: Result<T, StoreError>) -> Result<T, RuntimeError> {
        let value = match res {
            Ok(value) => value,
            Err(err) => {
                info!(%err, "command rejected");
                return Err(err.into());
            }
        };

        let mut first_err = None;
        for stored in self.store.drain_pending_ops() {
            match self.projector.apply_stored_op(&self.store, &stored) {
                Ok(changed) => {
                    for category_id in changed {
                        let _ = self.events_tx.send(ResultEvent::ResultsChanged { category_id });
                    }
                }
                Err(err) => warn!(seq = stored.seq, %err, "result projection failed"),
            }

            self.ops_since_snapshot += 1;
            if let Some(tx) = &self.persist_tx {
                if let Err(err) = enqueue_persist(tx, stored) {
                    warn!(%err, "op not journaled");
                    first_err.get_or_insert(err);
                }
            }
        }

        if self.persist_tx.is_none() {
            let _ = self.events_tx.send(ResultEvent::DurableUpTo {
                op_seq: self.store.latest_op_seq(),
            });
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(value),
        }
    }

    async fn flush(&self) -> Result<OpSeq, RuntimeError> {
        let Some(tx) = &self.persist_tx else {
            return Ok(self.store.latest_op_seq());
        };
        let (flush_tx, flush_rx) = oneshot::channel();
        tx.send(PersistMsg::Flush { resp: flush_tx })
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        Ok(flush_rx.await.map_err(|_| RuntimeError::ChannelClosed)??)
    }

    async fn checkpoint(&self) -> Result<(), RuntimeError> {
        let Some(tx) = &self.persist_tx else {
            return Ok(());
        };
        let (cp_tx, cp_rx) = oneshot::channel();
        tx.send(PersistMsg::Checkpoint {
            snapshot: self.store.export_snapshot(),
            last_seq: self.store.latest_op_seq(),
            compact: self.config.compact_after_snapshot,
            resp: cp_tx,
        })
        .await
        .map_err(|_| RuntimeError::ChannelClosed)?;
        Ok(cp_rx.await.map_err(|_| RuntimeError::ChannelClosed)??)
    }

    async fn maybe_auto_checkpoint(&mut self) {
        if self.persist_tx.is_none()
            || self.config.snapshot_every_ops == 0
            || self.ops_since_snapshot < self.config.snapshot_every_ops
        {
            return;
        }
        match self.checkpoint().await {
            Ok(()) => self.ops_since_snapshot = 0,
            Err(err) => warn!(%err, "automatic checkpoint failed"),
        }
    }
}

fn spawn_persistence_worker(
    sink: Box<dyn OpSink>,
    mut rx: mpsc::Receiver<PersistMsg>,
    durable_tx: mpsc::UnboundedSender<Result<OpSeq, PersistError>>,
    config: RuntimeConfig,
) {
    let sink = Arc::new(Mutex::new(sink));
    let latency = Duration::from_millis(config.batch_max_latency_ms);
    tokio::spawn(async move {
        let mut buf = Vec::<StoredOp>::new();
        let mut deadline = Instant::now() + latency;
        let mut last_durable: OpSeq = 0;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                        break;
                    };

                    match msg {
                        PersistMsg::Op(stored) => {
                            let is_readout = matches!(stored.op, Op::ReplacePunches { .. });
                            buf.push(stored);

                            if buf.len() >= config.batch_max_ops || (config.flush_on_readout && is_readout) {
                                let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                                deadline = Instant::now() + latency;
                            }
                        }
                        PersistMsg::Flush { resp } => {
                            let result = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                            let _ = resp.send(result.map(|_| last_durable));
                            deadline = Instant::now() + latency;
                        }
                        PersistMsg::Checkpoint { snapshot, last_seq, compact, resp } => {
                            let result = match flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await {
                                Err(err) => Err(err),
                                Ok(()) => on_sink(&sink, move |sink| {
                                    sink.write_snapshot(&snapshot, last_seq)?;
                                    if compact {
                                        let removed = sink.compact_through(last_seq)?;
                                        debug!(last_seq, removed, "journal compacted");
                                    }
                                    Ok(())
                                }).await,
                            };
                            let _ = resp.send(result);
                            deadline = Instant::now() + latency;
                        }
                        PersistMsg::Shutdown { resp } => {
                            let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, true).await;
                            let _ = resp.send(());
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !buf.is_empty() => {
                    let _ = flush_buf(&sink, &mut buf, &mut last_durable, &durable_tx, false).await;
                    deadline = Instant::now() + latency;
                }
            }
        }
    });
}

/// Runs `f` against the sink on the blocking pool.
async fn on_sink<T, F>(sink: &Arc<Mutex<Box<dyn OpSink>>>, f: F) -> Result<T, PersistError>
where
    T: Send + 'static,
    F: FnOnce(&mut Box<dyn OpSink>) -> Result<T, PersistError> + Send + 'static,
{
    let sink_ref = Arc::clone(sink);
    tokio::task::spawn_blocking(move || {
        let mut sink = sink_ref.blocking_lock();
        f(&mut sink)
    })
    .await
    .map_err(|e| PersistError::Message(format!("join error: {e}")))?
}

async fn flush_buf(
    sink: &Arc<Mutex<Box<dyn OpSink>>>,
    buf: &mut Vec<StoredOp>,
    last_durable: &mut OpSeq,
    durable_tx: &mpsc::UnboundedSender<Result<OpSeq, PersistError>>,
    call_flush: bool,
) -> Result<(), PersistError> {
    if buf.is_empty() {
        if call_flush {
            on_sink(sink, |sink| sink.flush()).await?;
        }
        return Ok(());
    }

    let ops = std::mem::take(buf);
    let append_res = on_sink(sink, move |sink| {
        let seq = sink.append_ops(&ops)?;
        if call_flush {
            sink.flush()?;
        }
        Ok(seq)
    })
    .await;

    match append_res {
        Ok(seq) => {
            *last_durable = (*last_durable).max(seq);
            let _ = durable_tx.send(Ok(*last_durable));
            Ok(())
        }
        Err(err) => {
            let _ = durable_tx.send(Err(PersistError::Message(format!("append failed: {err}"))));
            Err(err)
        }
    }
}

fn enqueue_persist(tx: &mpsc::Sender<PersistMsg>, stored: StoredOp) -> Result<(), RuntimeError> {
    tx.try_send(PersistMsg::Op(stored))
        .map_err(|err| RuntimeError::Persist(PersistError::Message(format!("persist queue error: {err}"))))
}
