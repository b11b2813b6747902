use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

use super::SharedCalendar;

/// Messages of one booking plus each reader's last-read mark.
#[derive(Debug, Clone, Default)]
pub struct Thread {
    /// Sorted by (created_at, id).
    pub messages: Vec<BookingMessage>,
    pub reads: HashMap<Ulid, Ms>,
}

impl Thread {
    pub fn latest(&self) -> Option<&BookingMessage> {
        self.messages.last()
    }

    fn push(&mut self, message: BookingMessage) {
        let key = (message.created_at, message.id);
        let pos = self
            .messages
            .partition_point(|m| (m.created_at, m.id) <= key);
        self.messages.insert(pos, message);
    }

    fn mark_read(&mut self, reader: Ulid, at: Ms) {
        let mark = self.reads.entry(reader).or_insert(at);
        *mark = (*mark).max(at);
    }
}

/// All state of one studio. Calendars are individually locked; everything else
/// lives in concurrent maps.
#[derive(Default)]
pub struct Store {
    calendars: DashMap<Ulid, SharedCalendar>,
    /// Reverse lookup: window/override/booking id → instructor id
    entity_to_instructor: DashMap<Ulid, Ulid>,
    /// member id → booking ids
    member_bookings: DashMap<Ulid, Vec<Ulid>>,
    threads: DashMap<Ulid, Thread>,
    profiles: DashMap<Ulid, Profile>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Calendars ────────────────────────────────────────────

    pub fn calendar(&self, instructor_id: &Ulid) -> Option<SharedCalendar> {
        self.calendars.get(instructor_id).map(|e| e.value().clone())
    }

    pub fn calendar_or_create(&self, instructor_id: Ulid) -> SharedCalendar {
        self.calendars
            .entry(instructor_id)
            .or_insert_with(|| Arc::new(RwLock::new(InstructorCalendar::new(instructor_id))))
            .value()
            .clone()
    }

    pub fn calendars(&self) -> Vec<SharedCalendar> {
        self.calendars.iter().map(|e| e.value().clone()).collect()
    }

    pub fn instructor_for(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_instructor.get(entity_id).map(|e| *e.value())
    }

    pub fn bookings_of_member(&self, member_id: &Ulid) -> Vec<Ulid> {
        self.member_bookings
            .get(member_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    // ── Profiles ─────────────────────────────────────────────

    pub fn profile(&self, id: &Ulid) -> Option<Profile> {
        self.profiles.get(id).map(|e| e.value().clone())
    }

    pub fn profiles(&self) -> Vec<Profile> {
        self.profiles.iter().map(|e| e.value().clone()).collect()
    }

    // ── Threads ──────────────────────────────────────────────

    pub fn thread(&self, booking_id: &Ulid) -> Option<Thread> {
        self.threads.get(booking_id).map(|e| e.value().clone())
    }

    pub fn message_count(&self, booking_id: &Ulid) -> usize {
        self.threads
            .get(booking_id)
            .map_or(0, |t| t.messages.len())
    }

    /// Latest message and the reader's mark, without cloning the thread.
    pub fn thread_head(&self, booking_id: &Ulid, reader: &Ulid) -> (Option<BookingMessage>, Option<Ms>) {
        match self.threads.get(booking_id) {
            Some(t) => (t.latest().cloned(), t.reads.get(reader).copied()),
            None => (None, None),
        }
    }

    pub fn thread_ids(&self) -> Vec<Ulid> {
        self.threads.iter().map(|e| *e.key()).collect()
    }

    // ── Event application ────────────────────────────────────

    /// Apply a calendar event. The caller holds the calendar's write lock.
    pub fn apply_to_calendar(&self, cal: &mut InstructorCalendar, event: &Event) {
        match event {
            Event::WindowAdded(window) => {
                self.entity_to_instructor.insert(window.id, window.instructor_id);
                cal.insert_window(window.clone());
            }
            Event::WindowRemoved { id, .. } => {
                cal.remove_window(*id);
                self.entity_to_instructor.remove(id);
            }
            Event::OverrideAdded(ov) => {
                self.entity_to_instructor.insert(ov.id, ov.instructor_id);
                cal.insert_override(ov.clone());
            }
            Event::OverrideRemoved { id, .. } => {
                cal.remove_override(*id);
                self.entity_to_instructor.remove(id);
            }
            Event::BookingRequested(booking) => {
                self.entity_to_instructor
                    .insert(booking.id, booking.instructor_id);
                let mut ids = self.member_bookings.entry(booking.member_id).or_default();
                if !ids.contains(&booking.id) {
                    ids.push(booking.id);
                }
                drop(ids);
                cal.insert_booking(booking.clone());
            }
            Event::BookingTransitioned { transition, .. } => {
                if let Some(booking) = cal.booking_mut(transition.booking_id) {
                    booking.status = transition.to;
                    booking.updated_at = transition.at;
                    if transition.to.is_cancelled() {
                        booking.cancelled_at = Some(transition.at);
                        booking.cancelled_by = transition.by;
                        booking.cancellation_reason = transition.reason.clone();
                    }
                }
            }
            Event::ProfileUpserted(_) | Event::MessagePosted(_) | Event::ThreadRead { .. } => {
                self.apply_shared(event)
            }
        }
    }

    /// Apply an event that does not touch a calendar.
    pub fn apply_shared(&self, event: &Event) {
        match event {
            Event::ProfileUpserted(profile) => {
                self.profiles.insert(profile.id, profile.clone());
            }
            Event::MessagePosted(message) => {
                self.threads
                    .entry(message.booking_id)
                    .or_default()
                    .push(message.clone());
            }
            Event::ThreadRead {
                booking_id,
                reader_id,
                at,
            } => {
                self.threads
                    .entry(*booking_id)
                    .or_default()
                    .mark_read(*reader_id, *at);
            }
            _ => {}
        }
    }
}

/// The instructor whose calendar an event changes, if any.
pub fn event_instructor_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::WindowAdded(w) => Some(w.instructor_id),
        Event::OverrideAdded(o) => Some(o.instructor_id),
        Event::BookingRequested(b) => Some(b.instructor_id),
        Event::WindowRemoved { instructor_id, .. }
        | Event::OverrideRemoved { instructor_id, .. }
        | Event::BookingTransitioned { instructor_id, .. } => Some(*instructor_id),
        Event::ProfileUpserted(_) | Event::MessagePosted(_) | Event::ThreadRead { .. } => None,
    }
}
