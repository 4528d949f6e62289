mod availability;
mod booking;
mod classes;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod quota;
mod recurrence;
mod scope;
mod series;
mod txn;

pub use availability::{free_spans, merge_overlapping, subtract_intervals, working_window};
pub use booking::{BookingOutcome, BookingRequest, OccurrenceInfo, RecurringOutcome};
pub use classes::{ClassOutcome, ClassRequest, EnrollOutcome};
pub use error::EngineError;
pub use queries::{AppointmentQuery, BranchFilter, ExpiredHold, SeriesInfo};
pub use quota::{MembershipStanding, QuotaTracker, UsageKind};
pub use recurrence::expand;
pub use scope::{AccessContext, BranchAccess, Role};
pub use series::{AppointmentChanges, MutationOutcome, SeriesScope};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::config::TenantConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;
pub type SharedCustomerState = Arc<Mutex<CustomerState>>;
pub type SharedSeriesState = Arc<Mutex<SeriesState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingFrame = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingFrame>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingFrame]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (events, _) in batch {
        if let Err(e) = wal.append_buffered(events) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One tenant's scheduling state. Mutable per-entity state sits behind its own
/// lock; catalog data lives directly in the maps.
pub struct Engine {
    pub(super) resources: DashMap<Ulid, SharedResourceState>,
    pub(super) customers: DashMap<Ulid, SharedCustomerState>,
    pub(super) series: DashMap<Ulid, SharedSeriesState>,
    pub(super) branches: DashMap<Ulid, Branch>,
    pub(super) services: DashMap<Ulid, Service>,
    pub(super) plans: DashMap<Ulid, MembershipPlan>,
    /// Normalized phone → customer id.
    pub(super) phones: DashMap<String, Ulid>,
    /// Reverse lookup: appointment/session/enrollment/time-off id → resource id
    pub(super) entity_to_resource: DashMap<Ulid, Ulid>,
    pub(super) config: watch::Sender<TenantConfig>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Commits hold it shared while they write and apply; compaction holds it
    /// exclusively so the snapshot never misses a committed frame.
    pub(super) commit_gate: RwLock<()>,
    /// Serializes catalog writes that check uniqueness before committing.
    pub(super) catalog: Mutex<()>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        defaults: TenantConfig,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            resources: DashMap::new(),
            customers: DashMap::new(),
            series: DashMap::new(),
            branches: DashMap::new(),
            services: DashMap::new(),
            plans: DashMap::new(),
            phones: DashMap::new(),
            entity_to_resource: DashMap::new(),
            config: watch::Sender::new(defaults),
            wal_tx,
            commit_gate: RwLock::new(()),
            catalog: Mutex::new(()),
            notify,
        };

        // Replay: we're the sole owner of every lock, so the try_* acquisitions
        // inside the replay transaction always succeed without waiting.
        let replayed = events.len();
        for event in events {
            let mut txn = txn::Txn::new();
            txn.lock_for_replay(&engine, &event);
            txn.apply(&engine, &event);
        }
        if replayed > 0 {
            info!("replayed {replayed} events from {}", wal_path.display());
        }

        Ok(engine)
    }

    /// Write one transaction's events to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn config(&self) -> TenantConfig {
        self.config.borrow().clone()
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_resource.get(entity_id).map(|e| *e.value())
    }

    pub(super) fn service(&self, id: Ulid) -> Result<Service, EngineError> {
        self.services
            .get(&id)
            .map(|s| s.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub(super) fn primary_branch(&self) -> Option<Ulid> {
        self.branches
            .iter()
            .filter(|b| b.primary)
            .map(|b| b.id)
            .min()
    }
}
