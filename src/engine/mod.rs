mod availability;
mod conflict;
mod error;
mod messaging;
mod mutations;
mod queries;
mod store;

pub use availability::{
    DayWindow, SlotGenerator, effective_windows, local_instant, local_placement,
    merge_overlapping, subtract_intervals,
};
pub use conflict::now_ms;
pub use error::{EngineError, ErrorKind};
pub use mutations::{NewBooking, NewOverride, NewWindow};
pub use queries::{BookingRole, check_date_range};
pub use store::Thread;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono_tz::Tz;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notice, NotifyHub, Topic};
use crate::wal::Wal;

use store::{Store, event_instructor_id};

pub type SharedCalendar = Arc<RwLock<InstructorCalendar>>;

/// Per-studio settings the engine needs to interpret civil time.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub timezone: Tz,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self { timezone: Tz::UTC }
    }
}

// ── Group-commit journal channel ─────────────────────────

enum WalCommand {
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

/// Background task that owns the journal and batches appends for group commit:
/// take one append, drain whatever else is already queued, fsync once, answer all.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes don't leak into the next batch.
    let flushed = wal.flush_sync();
    let result = result.and(flushed);

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
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
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The booking core of one studio.
pub struct Engine {
    store: Store,
    wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub settings: EngineSettings,
    /// Mutations hold it shared from check to apply; compaction takes it exclusively
    /// so no record lands in the old journal after the snapshot.
    commit_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, settings: EngineSettings) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        if let Some(why) = replay.discarded_tail {
            tracing::warn!(path = %wal_path.display(), why, "discarded journal tail");
        }
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: Store::new(),
            wal_tx,
            notify,
            settings,
            commit_gate: RwLock::new(()),
        };

        // We're the sole owner of these locks during replay, so try_write always
        // succeeds; blocking_write would panic inside an async context.
        for event in &replay.events {
            match event_instructor_id(event) {
                Some(instructor_id) => {
                    let cal = engine.store.calendar_or_create(instructor_id);
                    let mut guard = cal.try_write().expect("replay: uncontended write");
                    engine.store.apply_to_calendar(&mut guard, event);
                }
                None => engine.store.apply_shared(event),
            }
        }
        tracing::debug!(events = replay.events.len(), "journal replayed");

        Ok(engine)
    }

    pub fn timezone(&self) -> Tz {
        self.settings.timezone
    }

    /// Write event to the journal via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Journal + apply for calendar events. The caller holds the calendar write lock.
    async fn persist_calendar(
        &self,
        cal: &mut InstructorCalendar,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_to_calendar(cal, event);
        Ok(())
    }

    /// Journal + apply for events outside any calendar.
    async fn persist_shared(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_shared(event);
        Ok(())
    }

    fn announce_booking(&self, booking: &Booking) {
        let notice = Notice::BookingChanged {
            booking_id: booking.id,
            status: booking.status,
        };
        self.notify.send(Topic::Instructor(booking.instructor_id), &notice);
        self.notify.send(Topic::Booking(booking.id), &notice);
    }

    fn announce_availability(&self, instructor_id: Ulid) {
        self.notify.send(
            Topic::Instructor(instructor_id),
            &Notice::AvailabilityChanged { instructor_id },
        );
    }

    pub fn profile(&self, id: &Ulid) -> Option<Profile> {
        self.store.profile(id)
    }

    /// Resolve a window, override or booking id to its instructor's calendar.
    fn calendar_for_entity(
        &self,
        entity_id: &Ulid,
    ) -> Result<(Ulid, SharedCalendar), EngineError> {
        let instructor_id = self
            .store
            .instructor_for(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let cal = self
            .store
            .calendar(&instructor_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        Ok((instructor_id, cal))
    }

    /// Rewrite the journal with the minimal records that recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _exclusive = self.commit_gate.write().await;

        let mut events: Vec<Event> = self
            .store
            .profiles()
            .into_iter()
            .map(Event::ProfileUpserted)
            .collect();
        for cal in self.store.calendars() {
            let guard = cal.read().await;
            events.extend(guard.windows.iter().cloned().map(Event::WindowAdded));
            events.extend(guard.overrides.iter().cloned().map(Event::OverrideAdded));
            events.extend(guard.bookings.iter().cloned().map(Event::BookingRequested));
        }
        for booking_id in self.store.thread_ids() {
            let Some(thread) = self.store.thread(&booking_id) else { continue };
            events.extend(thread.messages.into_iter().map(Event::MessagePosted));
            events.extend(thread.reads.into_iter().map(|(reader_id, at)| Event::ThreadRead {
                booking_id,
                reader_id,
                at,
            }));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("journal writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("journal writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
