//! Wire shapes. Instants cross the boundary as RFC 3339; availability keeps
//! its civil `HH:MM` / `YYYY-MM-DD` values.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::{BookingRole, Engine};
use crate::model::*;
use crate::schedule::ScheduleItem;

fn default_slot_minutes() -> u16 {
    60
}

fn yes() -> bool {
    true
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ProfileRequest {
    pub display_name: Option<String>,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WindowRequest {
    /// Defaults to the caller.
    pub instructor_id: Option<Ulid>,
    pub day_of_week: u8,
    pub start_time: CivilTime,
    pub end_time: CivilTime,
    #[serde(default = "default_slot_minutes")]
    pub slot_duration_minutes: u16,
    #[serde(default = "yes")]
    pub is_active: bool,
    pub effective_from: Option<NaiveDate>,
    pub effective_until: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub instructor_id: Option<Ulid>,
    pub override_date: NaiveDate,
    pub start_time: Option<CivilTime>,
    pub end_time: Option<CivilTime>,
    pub is_available: bool,
    pub reason: Option<String>,
    #[serde(default = "default_slot_minutes")]
    pub slot_duration_minutes: u16,
}

#[derive(Debug, Deserialize)]
pub struct BookingRequest {
    pub instructor_id: Ulid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub notes: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Debug, Default, Deserialize)]
pub struct BookingFilter {
    #[serde(default)]
    pub role: BookingRole,
    pub status: Option<BookingStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RealtimeQuery {
    pub instructor_id: Option<Ulid>,
    pub booking_id: Option<Ulid>,
}

// ── Views ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ProfileView {
    pub id: Ulid,
    pub display_name: Option<String>,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl From<Profile> for ProfileView {
    fn from(p: Profile) -> Self {
        Self {
            id: p.id,
            display_name: p.display_name,
            full_name: p.full_name,
            avatar_url: p.avatar_url,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WindowView {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub day_of_week: u8,
    pub start_time: CivilTime,
    pub end_time: CivilTime,
    pub slot_duration_minutes: u16,
    pub is_active: bool,
    pub effective_from: Option<NaiveDate>,
    pub effective_until: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<AvailabilityWindow> for WindowView {
    fn from(w: AvailabilityWindow) -> Self {
        Self {
            id: w.id,
            instructor_id: w.instructor_id,
            day_of_week: w.day_of_week,
            start_time: w.start,
            end_time: w.end,
            slot_duration_minutes: w.slot_minutes,
            is_active: w.is_active,
            effective_from: w.effective_from,
            effective_until: w.effective_until,
            created_at: utc_instant(w.created_at),
            updated_at: utc_instant(w.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OverrideView {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub override_date: NaiveDate,
    pub start_time: Option<CivilTime>,
    pub end_time: Option<CivilTime>,
    pub is_available: bool,
    pub reason: Option<String>,
    pub slot_duration_minutes: u16,
    pub created_at: DateTime<Utc>,
}

impl From<AvailabilityOverride> for OverrideView {
    fn from(o: AvailabilityOverride) -> Self {
        Self {
            id: o.id,
            instructor_id: o.instructor_id,
            override_date: o.date,
            start_time: o.start,
            end_time: o.end,
            is_available: o.is_available,
            reason: o.reason,
            slot_duration_minutes: o.slot_minutes,
            created_at: utc_instant(o.created_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SlotView {
    pub slot_start: DateTime<Utc>,
    pub slot_end: DateTime<Utc>,
}

impl From<TimeSlot> for SlotView {
    fn from(s: TimeSlot) -> Self {
        Self {
            slot_start: utc_instant(s.slot_start),
            slot_end: utc_instant(s.slot_end),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BookingView {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub member_id: Ulid,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<Ulid>,
    pub cancellation_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Booking> for BookingView {
    fn from(b: Booking) -> Self {
        Self {
            id: b.id,
            instructor_id: b.instructor_id,
            member_id: b.member_id,
            start_time: utc_instant(b.span.start),
            end_time: utc_instant(b.span.end),
            status: b.status,
            notes: b.notes,
            cancelled_at: b.cancelled_at.map(utc_instant),
            cancelled_by: b.cancelled_by,
            cancellation_reason: b.cancellation_reason,
            created_at: utc_instant(b.created_at),
            updated_at: utc_instant(b.updated_at),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageView {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub sender_id: Ulid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<BookingMessage> for MessageView {
    fn from(m: BookingMessage) -> Self {
        Self {
            id: m.id,
            booking_id: m.booking_id,
            sender_id: m.sender_id,
            content: m.content,
            created_at: utc_instant(m.created_at),
        }
    }
}

/// The counterpart as shown in inbox rows.
#[derive(Debug, Serialize)]
pub struct PartyView {
    pub id: Ulid,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
}

impl PartyView {
    pub fn resolve(engine: &Engine, id: Ulid) -> Self {
        let profile = engine.profile(&id);
        Self {
            id,
            name: profile.as_ref().and_then(Profile::name).map(str::to_string),
            avatar_url: profile.and_then(|p| p.avatar_url),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UnreadView {
    pub booking_id: Ulid,
    pub other_party: PartyView,
    pub last_message: MessageView,
}

#[derive(Debug, Serialize)]
pub struct ConversationView {
    pub booking: BookingView,
    pub other_party: PartyView,
    pub last_message: Option<MessageView>,
    pub unread: bool,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct WindowRemovedView {
    pub success: bool,
    pub declined_bookings: usize,
    pub declined: Vec<Ulid>,
    pub confirmed_conflicts: Vec<Ulid>,
}

impl From<WindowRemoval> for WindowRemovedView {
    fn from(r: WindowRemoval) -> Self {
        Self {
            success: true,
            declined_bookings: r.declined.len(),
            declined: r.declined,
            confirmed_conflicts: r.confirmed_conflicts,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ScheduleView {
    pub items: Vec<ScheduleItem>,
    /// The event feed failed; only bookings are shown.
    pub events_unavailable: bool,
}

#[derive(Debug, Serialize)]
pub struct SweepView {
    pub expired: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
