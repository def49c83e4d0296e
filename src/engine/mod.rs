mod conflict;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use error::EngineError;
pub use mutations::PurgeCounts;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};

use crate::directory::Directory;
use crate::model::*;
use crate::wal::Wal;

pub type SharedSchedule = Arc<RwLock<DaySchedule>>;

// ── Group-commit WAL channel ─────────────────────────────

const TICKET_WAITING: u8 = 0;
const TICKET_CLAIMED: u8 = 1;
const TICKET_ABANDONED: u8 = 2;

/// Hand-off state of one queued append. The writer claims it before the
/// record is buffered; a caller past its deadline abandons it. Only the
/// first of the two succeeds, so an append is either written and applied
/// or neither.
#[derive(Clone)]
pub(super) struct Ticket(Arc<AtomicU8>);

impl Ticket {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(TICKET_WAITING)))
    }

    fn settle(&self, to: u8) -> bool {
        self.0
            .compare_exchange(TICKET_WAITING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn claim(&self) -> bool {
        self.settle(TICKET_CLAIMED)
    }

    fn abandon(&self) -> bool {
        self.settle(TICKET_ABANDONED)
    }
}

type QueuedAppend = (Event, oneshot::Sender<io::Result<()>>);

pub(super) enum WalCommand {
    Append {
        event: Event,
        ticket: Ticket,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    /// Hold the writer until `resume` fires or is dropped.
    #[cfg(test)]
    Stall { resume: oneshot::Receiver<()> },
}

/// Add an append to the batch unless its caller already gave up on it.
fn admit(
    batch: &mut Vec<QueuedAppend>,
    event: Event,
    ticket: Ticket,
    response: oneshot::Sender<io::Result<()>>,
) {
    if ticket.claim() {
        batch.push((event, response));
    } else {
        tracing::debug!("skipping WAL append abandoned after timeout");
    }
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Claim and buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
/// Appends whose ticket was abandoned are dropped unwritten.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append {
                event,
                ticket,
                response,
            } => {
                let mut batch = Vec::new();
                admit(&mut batch, event, ticket, response);
                let mut pending = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append {
                            event,
                            ticket,
                            response,
                        }) => admit(&mut batch, event, ticket, response),
                        Ok(other) => {
                            // Commit the batch before anything that rewrites the file.
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                if !batch.is_empty() {
                    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                        .record(batch.len() as f64);
                    let flush_start = std::time::Instant::now();
                    let result = flush_batch(&mut wal, &batch);
                    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                        .record(flush_start.elapsed().as_secs_f64());
                    if let Err(e) = &result {
                        tracing::error!("WAL flush of {} record(s) failed: {e}", batch.len());
                    }
                    respond_batch(batch, &result);
                }

                if let Some(other) = pending {
                    handle_non_append(&mut wal, other).await;
                }
            }
            other => handle_non_append(&mut wal, other).await,
        }
    }
    tracing::debug!("WAL writer stopped");
}

fn flush_batch(wal: &mut Wal, batch: &[QueuedAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    let result = match append_err {
        Some(e) => Err(e),
        None => wal.flush_sync(),
    };
    // Every caller of a failed batch is told so; none of its records may
    // survive to be replayed.
    if result.is_err() {
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback after failed batch failed: {e}");
        }
    }
    result
}

fn respond_batch(batch: Vec<QueuedAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

async fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append {
            event,
            ticket,
            response,
        } => {
            let mut batch = Vec::new();
            admit(&mut batch, event, ticket, response);
            if !batch.is_empty() {
                let result = flush_batch(wal, &batch);
                respond_batch(batch, &result);
            }
        }
        #[cfg(test)]
        WalCommand::Stall { resume } => {
            let _ = resume.await;
        }
    }
}

// ── Applying events ──────────────────────────────────────

/// Day schedules an event may be applied to: the replay map, a single
/// locked schedule, or a set of locked schedules.
pub(super) trait ScheduleSet {
    fn schedule_mut(&mut self, key: &SlotKey) -> Option<&mut DaySchedule>;
}

impl ScheduleSet for HashMap<SlotKey, DaySchedule> {
    fn schedule_mut(&mut self, key: &SlotKey) -> Option<&mut DaySchedule> {
        self.get_mut(key)
    }
}

impl ScheduleSet for DaySchedule {
    fn schedule_mut(&mut self, key: &SlotKey) -> Option<&mut DaySchedule> {
        (self.key == *key).then_some(self)
    }
}

impl ScheduleSet for Vec<OwnedRwLockWriteGuard<DaySchedule>> {
    fn schedule_mut(&mut self, key: &SlotKey) -> Option<&mut DaySchedule> {
        self.iter_mut().find(|g| g.key == *key).map(|g| &mut **g)
    }
}

/// Apply an event to schedules the caller already holds.
/// The schedule for a created booking must already exist in `schedules`.
fn apply_event(
    schedules: &mut impl ScheduleSet,
    event: &Event,
    index: &DashMap<BookingId, SlotKey>,
) {
    match event {
        Event::BookingCreated { booking } => {
            let key = booking.key();
            if let Some(ds) = schedules.schedule_mut(&key) {
                ds.insert_booking(booking.clone());
                index.insert(booking.id.clone(), key);
            }
        }
        Event::StatusChanged { changes, at } => {
            for change in changes {
                let Some(key) = index.get(&change.id).map(|k| k.value().clone()) else {
                    continue;
                };
                let Some(booking) = schedules
                    .schedule_mut(&key)
                    .and_then(|ds| ds.get_mut(&change.id))
                else {
                    continue;
                };
                booking.status = change.status;
                booking.updated_at = *at;
                if let Some(notes) = &change.notes {
                    booking.notes = Some(notes.clone());
                }
            }
        }
        Event::BookingsDeleted { ids } => {
            for id in ids {
                let Some(key) = index.get(id).map(|k| k.value().clone()) else {
                    continue;
                };
                if let Some(ds) = schedules.schedule_mut(&key) {
                    ds.remove_booking(id);
                    index.remove(id);
                }
            }
        }
        // Sequences live outside the schedules.
        Event::SequenceAdvanced { .. } => {}
    }
}

fn note_sequence(sequences: &DashMap<i32, u32>, year: i32, seq: u32) {
    let mut last = sequences.entry(year).or_insert(0);
    if *last < seq {
        *last = seq;
    }
}

pub struct Engine {
    pub(super) schedules: DashMap<SlotKey, SharedSchedule>,
    /// Reverse lookup: booking id → the day schedule holding it.
    pub(super) booking_index: DashMap<BookingId, SlotKey>,
    /// Last sequence number handed out per year.
    pub(super) sequences: DashMap<i32, u32>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Shared by every mutation, exclusive during compaction. Always taken
    /// before any schedule lock.
    pub(super) commit_gate: RwLock<()>,
    pub(super) directory: Arc<dyn Directory>,
    store_timeout: Duration,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        directory: Arc<dyn Directory>,
        store_timeout: Duration,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let booking_index = DashMap::new();
        let sequences = DashMap::new();
        let mut replayed: HashMap<SlotKey, DaySchedule> = HashMap::new();

        for event in &events {
            match event {
                Event::BookingCreated { booking } => {
                    let key = booking.key();
                    replayed
                        .entry(key.clone())
                        .or_insert_with(|| DaySchedule::new(key));
                    if let Some((year, seq)) = booking.id.parts() {
                        note_sequence(&sequences, year, seq);
                    }
                }
                Event::SequenceAdvanced { year, last } => note_sequence(&sequences, *year, *last),
                Event::StatusChanged { .. } | Event::BookingsDeleted { .. } => {}
            }
            apply_event(&mut replayed, event, &booking_index);
        }

        let schedules = DashMap::new();
        for (key, ds) in replayed {
            if !ds.is_empty() {
                schedules.insert(key, Arc::new(RwLock::new(ds)));
            }
        }

        tracing::info!(
            "replayed {} WAL record(s): {} booking(s) across {} day schedule(s)",
            events.len(),
            booking_index.len(),
            schedules.len()
        );

        Ok(Self {
            schedules,
            booking_index,
            sequences,
            wal_tx,
            commit_gate: RwLock::new(()),
            directory,
            store_timeout,
        })
    }

    /// Send one request to the WAL writer and wait for its answer, bounded
    /// by the store timeout.
    pub(super) async fn store_call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> WalCommand,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        let call = async {
            self.wal_tx
                .send(make(tx))
                .await
                .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;
            rx.await
                .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))
        };
        tokio::time::timeout(self.store_timeout, call)
            .await
            .map_err(|_| self.store_timed_out())?
    }

    /// Park the WAL writer behind everything queued so far. Work sent
    /// afterwards waits until the returned sender fires or is dropped.
    #[cfg(test)]
    pub(crate) async fn stall_writer(&self) -> oneshot::Sender<()> {
        let (tx, resume) = oneshot::channel();
        let _ = self.wal_tx.send(WalCommand::Stall { resume }).await;
        tx
    }

    fn store_timed_out(&self) -> EngineError {
        EngineError::StoreUnavailable(format!(
            "WAL did not respond within {}ms",
            self.store_timeout.as_millis()
        ))
    }

    /// Queue one record and wait for it to be durable.
    ///
    /// Past the deadline the append is abandoned if the writer has not
    /// picked it up yet, and the caller gets `StoreUnavailable` knowing the
    /// record will never be written. If the writer already claimed it, the
    /// real outcome is awaited instead so the caller can apply what landed.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let deadline = tokio::time::Instant::now() + self.store_timeout;
        let ticket = Ticket::new();
        let (response, mut rx) = oneshot::channel();
        let cmd = WalCommand::Append {
            event: event.clone(),
            ticket: ticket.clone(),
            response,
        };
        tokio::time::timeout_at(deadline, self.wal_tx.send(cmd))
            .await
            .map_err(|_| self.store_timed_out())?
            .map_err(|_| EngineError::StoreUnavailable("WAL writer shut down".into()))?;

        let waited = tokio::time::timeout_at(deadline, &mut rx).await;
        let answer = match waited {
            Ok(answer) => answer,
            Err(_) if ticket.abandon() => return Err(self.store_timed_out()),
            Err(_) => {
                tracing::warn!("WAL append outlived its deadline; waiting for the writer");
                rx.await
            }
        };
        answer
            .map_err(|_| EngineError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StoreUnavailable(e.to_string()))
    }

    /// WAL-append then apply to the locked schedules. Nothing is applied,
    /// now or on replay, if the append fails.
    pub(super) async fn commit(
        &self,
        schedules: &mut impl ScheduleSet,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_event(schedules, event, &self.booking_index);
        Ok(())
    }

    pub fn get_schedule(&self, key: &SlotKey) -> Option<SharedSchedule> {
        self.schedules.get(key).map(|e| e.value().clone())
    }

    pub(super) fn schedule_or_create(&self, key: &SlotKey) -> SharedSchedule {
        self.schedules
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(DaySchedule::new(key.clone()))))
            .clone()
    }

    pub fn get_key_for_booking(&self, id: &BookingId) -> Option<SlotKey> {
        self.booking_index.get(id).map(|e| e.value().clone())
    }

    /// Lookup booking → schedule, acquire its write lock and confirm the
    /// booking is still there.
    pub(super) async fn resolve_booking_write(
        &self,
        id: &BookingId,
    ) -> Result<OwnedRwLockWriteGuard<DaySchedule>, EngineError> {
        let key = self
            .get_key_for_booking(id)
            .ok_or_else(|| EngineError::booking_not_found(id))?;
        let ds = self
            .get_schedule(&key)
            .ok_or_else(|| EngineError::booking_not_found(id))?;
        let guard = ds.write_owned().await;
        if guard.get(id).is_none() {
            return Err(EngineError::booking_not_found(id));
        }
        Ok(guard)
    }

    /// Next free id for `year`. Skips any id already present so a replayed
    /// log with gaps never produces a duplicate.
    pub(super) fn allocate_id(&self, year: i32) -> BookingId {
        loop {
            let seq = {
                let mut last = self.sequences.entry(year).or_insert(0);
                *last += 1;
                *last
            };
            let id = BookingId::new(year, seq);
            if !self.booking_index.contains_key(&id) {
                return id;
            }
        }
    }

    /// Drop schedules that became empty and are no longer referenced.
    pub(super) fn prune_empty_schedules<'a>(&self, keys: impl IntoIterator<Item = &'a SlotKey>) {
        for key in keys {
            self.schedules.remove_if(key, |_, ds| {
                Arc::strong_count(ds) == 1 && ds.try_read().is_ok_and(|g| g.is_empty())
            });
        }
    }
}
