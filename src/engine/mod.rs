mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{free_windows, merge_overlapping, subtract_slots};
pub use error::LedgerError;
pub use queries::end_of_day;
pub(crate) use conflict::today;

use std::collections::HashMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::audit::AuditSink;
use crate::catalog::FacilityCatalog;
use crate::model::*;
use crate::wal::Wal;

pub type SharedPartition = Arc<RwLock<Partition>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Takes the first append, drains whatever else is already
/// queued, then fsyncs once for the whole batch and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                // Compaction must see every append queued before it.
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

/// One write and one fsync for the whole batch. A batch either lands
/// completely or is cut back off the log, and every sender hears the result.
fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut records = Vec::with_capacity(batch.len());
    let mut senders = Vec::with_capacity(batch.len());
    for (event, tx) in batch {
        match Wal::encode(&event) {
            Ok(record) => {
                records.push(record);
                senders.push(tx);
            }
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        }
    }
    if records.is_empty() {
        return;
    }

    let result = wal.write_batch(&records);
    if let Err(e) = &result {
        tracing::error!(batch = records.len(), "WAL batch rejected: {e}");
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for tx in senders {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
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
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

// ── Ledger ───────────────────────────────────────────────

/// Authoritative store of bookings and waitlist entries for one campus.
///
/// State is split into (facility, date) partitions. Every read-then-write
/// sequence holds the partition's write lock across the conflict check, the
/// WAL append and the in-memory apply, so two requests for the same facility
/// and day can never both observe a free slot.
pub struct Ledger {
    pub(super) partitions: DashMap<PartitionKey, SharedPartition>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Booking and waitlist-entry ids → owning partition.
    pub(super) entity_to_partition: DashMap<Ulid, PartitionKey>,
    /// Shared by every partition writer, taken exclusively by compaction so
    /// its snapshot and the log swap see no commit in between.
    pub(super) commit_gate: Arc<RwLock<()>>,
    pub(super) catalog: Arc<dyn FacilityCatalog>,
    pub(super) audit: Arc<dyn AuditSink>,
}

/// Partition write lock plus a shared hold on the commit gate.
pub(super) struct PartitionGuard {
    partition: OwnedRwLockWriteGuard<Partition>,
    _commit: OwnedRwLockReadGuard<()>,
}

impl Deref for PartitionGuard {
    type Target = Partition;

    fn deref(&self) -> &Partition {
        &self.partition
    }
}

impl DerefMut for PartitionGuard {
    fn deref_mut(&mut self) -> &mut Partition {
        &mut self.partition
    }
}

/// Waitlist entry → confirmed booking, inside one partition.
fn promote(p: &mut Partition, entry_id: Ulid, booking_id: Ulid, at: Ms, index: &DashMap<Ulid, PartitionKey>) {
    if let Some(entry) = p.dequeue(entry_id) {
        index.remove(&entry_id);
        index.insert(booking_id, p.key);
        p.insert_booking(Booking::confirmed(booking_id, entry.owner, entry.facility, entry.slot, at));
    }
}

/// Apply a committed event to its partition (caller holds the lock).
fn apply_to_partition(p: &mut Partition, event: &Event, index: &DashMap<Ulid, PartitionKey>) {
    match event {
        Event::BookingConfirmed { id, owner, facility, slot, at } => {
            p.insert_booking(Booking::confirmed(*id, owner.clone(), *facility, *slot, *at));
            index.insert(*id, p.key);
        }
        Event::BookingWaitlisted { id, owner, facility, slot, at } => {
            p.enqueue(WaitlistEntry {
                id: *id,
                owner: owner.clone(),
                facility: *facility,
                slot: *slot,
                created_at: *at,
            });
            index.insert(*id, p.key);
        }
        Event::BookingCancelled { id, at, promotions, .. } => {
            if let Some(b) = p.booking_mut(*id) {
                b.status = BookingStatus::Cancelled;
                b.modified_at = *at;
            }
            for promotion in promotions {
                promote(p, promotion.entry_id, promotion.booking_id, *at, index);
            }
        }
        Event::WaitlistApproved { entry_id, booking_id, at, .. } => {
            promote(p, *entry_id, *booking_id, *at, index);
        }
        Event::WaitlistWithdrawn { id, .. } | Event::WaitlistExpired { id, .. } => {
            p.dequeue(*id);
            index.remove(id);
        }
    }
}

impl Ledger {
    /// Replay the WAL at `wal_path` and start its group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        catalog: Arc<dyn FacilityCatalog>,
        audit: Arc<dyn AuditSink>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let entity_to_partition = DashMap::new();
        let mut rebuilt: HashMap<PartitionKey, Partition> = HashMap::new();
        for event in &events {
            let key = event.partition_key();
            let p = rebuilt.entry(key).or_insert_with(|| Partition::new(key));
            apply_to_partition(p, event, &entity_to_partition);
        }
        tracing::debug!(
            events = events.len(),
            partitions = rebuilt.len(),
            "ledger replayed {}",
            wal_path.display()
        );

        Ok(Self {
            partitions: rebuilt
                .into_iter()
                .map(|(k, p)| (k, Arc::new(RwLock::new(p))))
                .collect(),
            wal_tx,
            entity_to_partition,
            commit_gate: Arc::new(RwLock::new(())),
            catalog,
            audit,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), LedgerError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| LedgerError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| LedgerError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| LedgerError::WalError(e.to_string()))
    }

    /// WAL-append then apply. Nothing changes in memory unless the append
    /// is durable.
    pub(super) async fn persist_and_apply(
        &self,
        p: &mut Partition,
        event: &Event,
    ) -> Result<(), LedgerError> {
        self.wal_append(event).await?;
        apply_to_partition(p, event, &self.entity_to_partition);
        metrics::counter!(crate::observability::LEDGER_EVENTS_TOTAL, "kind" => event.kind())
            .increment(1);
        Ok(())
    }

    pub(super) fn get_partition(&self, key: &PartitionKey) -> Option<SharedPartition> {
        self.partitions.get(key).map(|e| e.value().clone())
    }

    /// Write lock on a partition, creating it empty if needed.
    pub(super) async fn partition_write(&self, key: PartitionKey) -> PartitionGuard {
        let commit = self.commit_gate.clone().read_owned().await;
        let shared = self
            .partitions
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(Partition::new(key))))
            .value()
            .clone();
        PartitionGuard {
            partition: shared.write_owned().await,
            _commit: commit,
        }
    }

    pub fn partition_for_entity(&self, id: &Ulid) -> Option<PartitionKey> {
        self.entity_to_partition.get(id).map(|e| *e.value())
    }

    /// Lookup entity → partition, acquire its write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        id: &Ulid,
    ) -> Result<PartitionGuard, LedgerError> {
        let commit = self.commit_gate.clone().read_owned().await;
        let key = self.partition_for_entity(id).ok_or(LedgerError::NotFound(*id))?;
        let shared = self.get_partition(&key).ok_or(LedgerError::NotFound(*id))?;
        Ok(PartitionGuard {
            partition: shared.write_owned().await,
            _commit: commit,
        })
    }

    /// Snapshot of the partition handles; never hold DashMap refs across awaits.
    pub(super) fn partition_handles(&self) -> Vec<(PartitionKey, SharedPartition)> {
        self.partitions
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }
}
