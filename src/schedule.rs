//! The unified schedule: studio calendar events and the viewer's private
//! lessons merged into one list of render-ready items.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::{Booking, BookingStatus, Profile, utc_instant};

/// Lessons show up as bookings; the events subsystem's own copies are dropped.
const PRIVATE_LESSON_EVENT_TYPE: &str = "private_lesson";

const CANCELLED_COLOR: &str = "#9ca3af";

/// A studio calendar event as supplied by the events subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    pub event_type: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub instructor_id: Option<Ulid>,
    #[serde(default)]
    pub capacity: Option<u32>,
    #[serde(default)]
    pub rsvp_count: u32,
}

/// A booking plus whatever profiles are known for its two participants.
#[derive(Debug, Clone)]
pub struct BookingWithParties {
    pub booking: Booking,
    pub instructor: Option<Profile>,
    pub member: Option<Profile>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Event,
    Booking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BorderStyle {
    Solid,
    Dashed,
    Dotted,
}

/// How the viewer relates to a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleRole {
    Teaching,
    Attending,
    Observing,
}

impl ScheduleRole {
    fn color(self) -> &'static str {
        match self {
            ScheduleRole::Teaching => "#10b981",
            ScheduleRole::Attending => "#f59e0b",
            ScheduleRole::Observing => "#94a3b8",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleItem {
    #[serde(rename = "type")]
    pub kind: ItemKind,
    /// `event-<id>` or `booking-<id>`.
    pub id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub color: &'static str,
    pub border: BorderStyle,
    pub opacity: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsvp_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructor_id: Option<Ulid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub booking_id: Option<Ulid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<ScheduleRole>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<BookingStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub other_party_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub other_party_avatar: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unread: Option<bool>,
}

fn event_color(event_type: &str) -> &'static str {
    match event_type {
        "class" => "#3b82f6",
        "workshop" => "#8b5cf6",
        "social" => "#ec4899",
        _ => "#64748b",
    }
}

fn event_item(event: &CalendarEvent) -> ScheduleItem {
    ScheduleItem {
        kind: ItemKind::Event,
        id: format!("event-{}", event.id),
        title: event.title.clone(),
        start: event.start_time,
        end: event.end_time,
        color: event_color(&event.event_type),
        border: BorderStyle::Solid,
        opacity: 1.0,
        event_type: Some(event.event_type.clone()),
        capacity: event.capacity,
        rsvp_count: Some(event.rsvp_count),
        instructor_id: event.instructor_id,
        booking_id: None,
        role: None,
        status: None,
        other_party_name: None,
        other_party_avatar: None,
        unread: None,
    }
}

fn booking_item(entry: &BookingWithParties, viewer: Ulid, unread: &HashSet<Ulid>) -> ScheduleItem {
    let booking = &entry.booking;
    let (role, other) = if booking.instructor_id == viewer {
        (ScheduleRole::Teaching, entry.member.as_ref())
    } else if booking.member_id == viewer {
        (ScheduleRole::Attending, entry.instructor.as_ref())
    } else {
        (ScheduleRole::Observing, None)
    };
    let other_name = other.and_then(Profile::name).map(str::to_string);

    let title = match (role, &other_name) {
        (ScheduleRole::Observing, _) | (_, None) => "Private lesson".to_string(),
        (_, Some(name)) => format!("Lesson with {name}"),
    };

    let (color, border, opacity) = match booking.status {
        BookingStatus::Pending => (role.color(), BorderStyle::Dashed, 0.8),
        BookingStatus::Confirmed => (role.color(), BorderStyle::Solid, 1.0),
        BookingStatus::Completed | BookingStatus::NoShow => (role.color(), BorderStyle::Solid, 0.7),
        BookingStatus::Declined
        | BookingStatus::Expired
        | BookingStatus::CancelledByMember
        | BookingStatus::CancelledByInstructor => (CANCELLED_COLOR, BorderStyle::Dotted, 0.5),
    };

    ScheduleItem {
        kind: ItemKind::Booking,
        id: format!("booking-{}", booking.id),
        title,
        start: utc_instant(booking.span.start),
        end: utc_instant(booking.span.end),
        color,
        border,
        opacity,
        event_type: None,
        capacity: None,
        rsvp_count: None,
        instructor_id: Some(booking.instructor_id),
        booking_id: Some(booking.id),
        role: Some(role),
        status: Some(booking.status),
        other_party_name: other_name,
        other_party_avatar: other.and_then(|p| p.avatar_url.clone()),
        unread: Some(unread.contains(&booking.id)),
    }
}

/// Merge events and bookings into one list ordered by start, then id.
/// No I/O: the output depends only on the arguments.
pub fn build_schedule(
    events: &[CalendarEvent],
    bookings: &[BookingWithParties],
    viewer: Ulid,
    unread: &HashSet<Ulid>,
) -> Vec<ScheduleItem> {
    let mut items: Vec<ScheduleItem> = events
        .iter()
        .filter(|e| e.event_type != PRIVATE_LESSON_EVENT_TYPE)
        .map(event_item)
        .chain(bookings.iter().map(|b| booking_item(b, viewer, unread)))
        .collect();
    items.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.id.cmp(&b.id)));
    items
}

// ── Event feed ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedError(pub String);

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "calendar feed unavailable: {}", self.0)
    }
}

impl std::error::Error for FeedError {}

/// Read-only source of studio calendar events.
#[async_trait]
pub trait CalendarFeed: Send + Sync {
    /// Events of `studio` overlapping `[start, end)`.
    async fn events_between(
        &self,
        studio: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, FeedError>;
}

/// Feed held in memory, optionally seeded from a `{"<studio>": [events]}` JSON file.
#[derive(Default)]
pub struct MemoryCalendarFeed {
    events: DashMap<String, Vec<CalendarEvent>>,
}

impl MemoryCalendarFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let by_studio: HashMap<String, Vec<CalendarEvent>> = serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let feed = Self::new();
        for (studio, events) in by_studio {
            for event in events {
                feed.insert(&studio, event);
            }
        }
        Ok(feed)
    }

    pub fn insert(&self, studio: &str, event: CalendarEvent) {
        let mut events = self.events.entry(studio.to_string()).or_default();
        let pos = events.partition_point(|e| e.start_time <= event.start_time);
        events.insert(pos, event);
    }
}

#[async_trait]
impl CalendarFeed for MemoryCalendarFeed {
    async fn events_between(
        &self,
        studio: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<CalendarEvent>, FeedError> {
        Ok(self
            .events
            .get(studio)
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.start_time < end && e.end_time > start)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Span;
    use chrono::TimeZone;

    fn utc(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 7, hour, 0, 0).unwrap()
    }

    fn event(id: &str, event_type: &str, hour: u32) -> CalendarEvent {
        CalendarEvent {
            id: id.into(),
            title: format!("{event_type} {id}"),
            event_type: event_type.into(),
            start_time: utc(hour),
            end_time: utc(hour + 1),
            instructor_id: None,
            capacity: Some(20),
            rsvp_count: 4,
        }
    }

    fn profile(id: Ulid, display: Option<&str>, full: &str) -> Profile {
        Profile {
            id,
            display_name: display.map(Into::into),
            full_name: Some(full.into()),
            avatar_url: Some(format!("https://img.example/{id}")),
        }
    }

    fn lesson(instructor: Ulid, member: Ulid, hour: u32, status: BookingStatus) -> BookingWithParties {
        let start = utc(hour).timestamp_millis();
        BookingWithParties {
            booking: Booking {
                id: Ulid::new(),
                instructor_id: instructor,
                member_id: member,
                span: Span::new(start, start + 3_600_000),
                status,
                notes: None,
                cancelled_at: None,
                cancelled_by: None,
                cancellation_reason: None,
                created_at: 0,
                updated_at: 0,
            },
            instructor: Some(profile(instructor, Some("Mia"), "Mia Lopez")),
            member: Some(profile(member, None, "Sam Carter")),
        }
    }

    #[test]
    fn merges_sorted_and_drops_private_lesson_events() {
        let (tutor, student) = (Ulid::new(), Ulid::new());
        let events = vec![
            event("b", "workshop", 12),
            event("a", "class", 9),
            event("dup", PRIVATE_LESSON_EVENT_TYPE, 10),
        ];
        let bookings = vec![lesson(tutor, student, 10, BookingStatus::Confirmed)];

        let items = build_schedule(&events, &bookings, student, &HashSet::new());
        let ids: Vec<&str> = items.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], "event-a");
        assert!(ids[1].starts_with("booking-"));
        assert_eq!(ids[2], "event-b");
        assert_eq!(items[0].color, "#3b82f6");
        assert_eq!(items[2].color, "#8b5cf6");
        assert_eq!(items[0].unread, None);
    }

    #[test]
    fn booking_role_and_other_party() {
        let (tutor, student) = (Ulid::new(), Ulid::new());
        let bookings = vec![lesson(tutor, student, 10, BookingStatus::Confirmed)];

        let as_tutor = build_schedule(&[], &bookings, tutor, &HashSet::new());
        assert_eq!(as_tutor[0].role, Some(ScheduleRole::Teaching));
        assert_eq!(as_tutor[0].other_party_name.as_deref(), Some("Sam Carter"));
        assert_eq!(as_tutor[0].title, "Lesson with Sam Carter");
        assert_eq!(as_tutor[0].color, "#10b981");

        let as_student = build_schedule(&[], &bookings, student, &HashSet::new());
        assert_eq!(as_student[0].role, Some(ScheduleRole::Attending));
        assert_eq!(as_student[0].other_party_name.as_deref(), Some("Mia"));
        assert_eq!(as_student[0].color, "#f59e0b");

        let as_staff = build_schedule(&[], &bookings, Ulid::new(), &HashSet::new());
        assert_eq!(as_staff[0].role, Some(ScheduleRole::Observing));
        assert_eq!(as_staff[0].other_party_name, None);
    }

    #[test]
    fn status_rendering() {
        let (tutor, student) = (Ulid::new(), Ulid::new());
        let bookings = vec![
            lesson(tutor, student, 8, BookingStatus::Pending),
            lesson(tutor, student, 9, BookingStatus::CancelledByMember),
            lesson(tutor, student, 10, BookingStatus::Completed),
        ];
        let items = build_schedule(&[], &bookings, student, &HashSet::new());
        assert_eq!((items[0].border, items[0].opacity), (BorderStyle::Dashed, 0.8));
        assert_eq!(items[1].border, BorderStyle::Dotted);
        assert_eq!(items[1].color, CANCELLED_COLOR);
        assert_eq!(items[1].opacity, 0.5);
        assert_eq!(items[2].opacity, 0.7);
    }

    #[test]
    fn unread_flag_only_on_bookings() {
        let (tutor, student) = (Ulid::new(), Ulid::new());
        let bookings = vec![
            lesson(tutor, student, 10, BookingStatus::Confirmed),
            lesson(tutor, student, 11, BookingStatus::Confirmed),
        ];
        let unread: HashSet<Ulid> = [bookings[1].booking.id].into();
        let items = build_schedule(&[event("x", "social", 10)], &bookings, student, &unread);
        let flags: Vec<Option<bool>> = items.iter().map(|i| i.unread).collect();
        // booking-… sorts before event-… at the same start
        assert_eq!(flags, vec![Some(false), None, Some(true)]);
    }

    #[test]
    fn deterministic_for_same_input() {
        let (tutor, student) = (Ulid::new(), Ulid::new());
        let events = vec![event("a", "class", 9), event("b", "social", 9)];
        let bookings = vec![lesson(tutor, student, 9, BookingStatus::Pending)];
        let first = build_schedule(&events, &bookings, student, &HashSet::new());
        let second = build_schedule(&events, &bookings, student, &HashSet::new());
        assert_eq!(first, second);
    }

    #[test]
    fn item_json_shape() {
        let items = build_schedule(&[event("a", "class", 9)], &[], Ulid::new(), &HashSet::new());
        let json = serde_json::to_value(&items[0]).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["border"], "solid");
        assert!(json.get("unread").is_none());
    }

    #[tokio::test]
    async fn memory_feed_filters_by_studio_and_range() {
        let feed = MemoryCalendarFeed::new();
        feed.insert("tango", event("late", "class", 18));
        feed.insert("tango", event("early", "class", 8));
        feed.insert("swing", event("other", "social", 9));

        let got = feed.events_between("tango", utc(7), utc(12)).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "early");
        // touching the end of the range does not count
        assert!(feed.events_between("tango", utc(9), utc(18)).await.unwrap().is_empty());
        assert!(feed.events_between("salsa", utc(0), utc(23)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn memory_feed_from_json_file() {
        let dir = std::env::temp_dir().join("lessond_test_feed");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("events.json");
        let seed: HashMap<&str, Vec<CalendarEvent>> =
            [("tango", vec![event("a", "class", 9)])].into();
        std::fs::write(&path, serde_json::to_vec(&seed).unwrap()).unwrap();

        let feed = MemoryCalendarFeed::from_file(&path).unwrap();
        let got = feed.events_between("tango", utc(0), utc(23)).await.unwrap();
        assert_eq!(got.len(), 1);

        std::fs::write(&path, b"not json").unwrap();
        assert!(MemoryCalendarFeed::from_file(&path).is_err());
    }
}
