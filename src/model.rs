use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use ulid::Ulid;

/// Unix milliseconds, the only instant type inside the engine.
pub type Ms = i64;

/// Out-of-range values clamp to the earliest representable instant.
pub fn utc_instant(ms: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Civil time ───────────────────────────────────────────────────

pub const MINUTES_PER_DAY: u16 = 24 * 60;

/// Wall-clock time of day with no zone, stored as minutes since midnight.
/// `24:00` is accepted so a window can run to the end of the day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CivilTime(u16);

impl CivilTime {
    pub fn from_minutes(minutes: u16) -> Option<Self> {
        (minutes <= MINUTES_PER_DAY).then_some(Self(minutes))
    }

    pub fn hm(hour: u16, minute: u16) -> Self {
        debug_assert!(minute < 60 && hour * 60 + minute <= MINUTES_PER_DAY);
        Self(hour * 60 + minute)
    }

    pub fn minutes(self) -> u16 {
        self.0
    }
}

impl fmt::Display for CivilTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CivilTimeError(pub String);

impl fmt::Display for CivilTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time of day '{}', expected HH:MM", self.0)
    }
}

impl std::error::Error for CivilTimeError {}

impl FromStr for CivilTime {
    type Err = CivilTimeError;

    /// Accepts `HH:MM` and `HH:MM:SS` (seconds must be zero).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || CivilTimeError(s.to_string());
        let mut parts = s.split(':');
        let hour: u16 = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        let minute: u16 = parts.next().ok_or_else(err)?.parse().map_err(|_| err())?;
        if let Some(sec) = parts.next() {
            let sec: u16 = sec.parse().map_err(|_| err())?;
            if sec != 0 {
                return Err(err());
            }
        }
        if parts.next().is_some() || minute >= 60 {
            return Err(err());
        }
        let total = hour.checked_mul(60).and_then(|m| m.checked_add(minute)).ok_or_else(err)?;
        Self::from_minutes(total).ok_or_else(err)
    }
}

impl Serialize for CivilTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CivilTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// 0 = Sunday .. 6 = Saturday.
pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

// ── Callers ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Guest,
    Member,
    Instructor,
    Staff,
    Owner,
}

impl Role {
    /// Staff and owners act for the studio rather than for themselves.
    pub fn is_studio(self) -> bool {
        matches!(self, Role::Staff | Role::Owner)
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "guest" => Ok(Role::Guest),
            "member" => Ok(Role::Member),
            "instructor" => Ok(Role::Instructor),
            "staff" => Ok(Role::Staff),
            "owner" => Ok(Role::Owner),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// The authenticated identity behind a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub id: Ulid,
    pub role: Role,
}

impl Caller {
    pub fn new(id: Ulid, role: Role) -> Self {
        Self { id, role }
    }

    pub fn is_owner(&self) -> bool {
        self.role == Role::Owner
    }

    /// May write this instructor's availability and answer their requests.
    pub fn manages(&self, instructor_id: Ulid) -> bool {
        self.role != Role::Guest && (self.id == instructor_id || self.is_owner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: Ulid,
    pub display_name: Option<String>,
    pub full_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl Profile {
    /// Display name, falling back to the full name.
    pub fn name(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .or(self.full_name.as_deref().filter(|n| !n.trim().is_empty()))
    }
}

// ── Availability ─────────────────────────────────────────────────

/// A recurring weekly window of bookable time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub day_of_week: u8,
    pub start: CivilTime,
    pub end: CivilTime,
    pub slot_minutes: u16,
    pub is_active: bool,
    pub effective_from: Option<NaiveDate>,
    pub effective_until: Option<NaiveDate>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl AvailabilityWindow {
    /// Whether this window produces time on `date`.
    pub fn applies_on(&self, date: NaiveDate) -> bool {
        self.is_active
            && self.day_of_week == day_of_week(date)
            && self.effective_from.is_none_or(|from| date >= from)
            && self.effective_until.is_none_or(|until| date <= until)
    }
}

/// A single-date exception to the weekly windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityOverride {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub date: NaiveDate,
    pub start: Option<CivilTime>,
    pub end: Option<CivilTime>,
    pub is_available: bool,
    pub reason: Option<String>,
    pub slot_minutes: u16,
    pub created_at: Ms,
}

impl AvailabilityOverride {
    pub fn window(&self) -> Option<(CivilTime, CivilTime)> {
        self.start.zip(self.end)
    }

    pub fn is_all_day_block(&self) -> bool {
        !self.is_available && self.window().is_none()
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Declined,
    Expired,
    CancelledByMember,
    CancelledByInstructor,
    Completed,
    NoShow,
}

impl BookingStatus {
    /// Pending and confirmed bookings hold their time.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn is_cancelled(self) -> bool {
        matches!(
            self,
            BookingStatus::CancelledByMember | BookingStatus::CancelledByInstructor
        )
    }

    /// The closed transition table.
    pub fn can_become(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        match self {
            Pending => matches!(
                next,
                Confirmed | Declined | Expired | CancelledByMember | CancelledByInstructor
            ),
            Confirmed => matches!(
                next,
                CancelledByMember | CancelledByInstructor | Completed | NoShow
            ),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Declined => "declined",
            BookingStatus::Expired => "expired",
            BookingStatus::CancelledByMember => "cancelled_by_member",
            BookingStatus::CancelledByInstructor => "cancelled_by_instructor",
            BookingStatus::Completed => "completed",
            BookingStatus::NoShow => "no_show",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use BookingStatus::*;
        [
            Pending,
            Confirmed,
            Declined,
            Expired,
            CancelledByMember,
            CancelledByInstructor,
            Completed,
            NoShow,
        ]
        .into_iter()
        .find(|st| st.as_str() == s)
        .ok_or_else(|| format!("unknown booking status '{s}'"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub instructor_id: Ulid,
    pub member_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    pub notes: Option<String>,
    pub cancelled_at: Option<Ms>,
    pub cancelled_by: Option<Ulid>,
    pub cancellation_reason: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn is_participant(&self, user: Ulid) -> bool {
        self.instructor_id == user || self.member_id == user
    }

    /// The participant on the other side of `user`.
    pub fn counterpart(&self, user: Ulid) -> Ulid {
        if user == self.instructor_id {
            self.member_id
        } else {
            self.instructor_id
        }
    }

    /// Participants, staff and owners may see a booking and its thread.
    pub fn visible_to(&self, caller: &Caller) -> bool {
        self.is_participant(caller.id) || caller.role.is_studio()
    }
}

/// A status change recorded against a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub booking_id: Ulid,
    pub to: BookingStatus,
    pub at: Ms,
    pub by: Option<Ulid>,
    pub reason: Option<String>,
}

// ── Messaging ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingMessage {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub sender_id: Ulid,
    pub content: String,
    pub created_at: Ms,
}

// ── Per-instructor state ─────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct InstructorCalendar {
    pub instructor_id: Ulid,
    /// Sorted by (day_of_week, start).
    pub windows: Vec<AvailabilityWindow>,
    /// Sorted by date.
    pub overrides: Vec<AvailabilityOverride>,
    /// Every booking ever made, sorted by `span.start`.
    pub bookings: Vec<Booking>,
}

impl InstructorCalendar {
    pub fn new(instructor_id: Ulid) -> Self {
        Self {
            instructor_id,
            windows: Vec::new(),
            overrides: Vec::new(),
            bookings: Vec::new(),
        }
    }

    pub fn insert_window(&mut self, window: AvailabilityWindow) {
        let key = (window.day_of_week, window.start);
        let pos = self
            .windows
            .partition_point(|w| (w.day_of_week, w.start) <= key);
        self.windows.insert(pos, window);
    }

    pub fn remove_window(&mut self, id: Ulid) -> Option<AvailabilityWindow> {
        let pos = self.windows.iter().position(|w| w.id == id)?;
        Some(self.windows.remove(pos))
    }

    pub fn insert_override(&mut self, ov: AvailabilityOverride) {
        let pos = self.overrides.partition_point(|o| o.date <= ov.date);
        self.overrides.insert(pos, ov);
    }

    pub fn remove_override(&mut self, id: Ulid) -> Option<AvailabilityOverride> {
        let pos = self.overrides.iter().position(|o| o.id == id)?;
        Some(self.overrides.remove(pos))
    }

    pub fn overrides_on(&self, date: NaiveDate) -> &[AvailabilityOverride] {
        let lo = self.overrides.partition_point(|o| o.date < date);
        let hi = self.overrides.partition_point(|o| o.date <= date);
        &self.overrides[lo..hi]
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings whose span overlaps the query window.
    /// Binary search skips bookings starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// Pending or confirmed bookings overlapping the query window.
    pub fn active_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        self.overlapping(query).filter(|b| b.status.is_active())
    }
}

/// Journal record format. Every mutation of engine state is one of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProfileUpserted(Profile),
    WindowAdded(AvailabilityWindow),
    WindowRemoved { id: Ulid, instructor_id: Ulid },
    OverrideAdded(AvailabilityOverride),
    OverrideRemoved { id: Ulid, instructor_id: Ulid },
    BookingRequested(Booking),
    BookingTransitioned {
        instructor_id: Ulid,
        transition: Transition,
    },
    MessagePosted(BookingMessage),
    ThreadRead {
        booking_id: Ulid,
        reader_id: Ulid,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

/// A bookable slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSlot {
    pub slot_start: Ms,
    pub slot_end: Ms,
}

impl TimeSlot {
    pub fn span(&self) -> Span {
        Span::new(self.slot_start, self.slot_end)
    }
}

/// Result of deleting a weekly window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRemoval {
    pub window: AvailabilityWindow,
    pub declined: Vec<Ulid>,
    /// Confirmed bookings inside the removed window, left for a deliberate cancellation.
    pub confirmed_conflicts: Vec<Ulid>,
}

/// One row of the unread roll-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadSummary {
    pub booking_id: Ulid,
    pub other_party_id: Ulid,
    pub last_message: BookingMessage,
}

/// One row of the inbox view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub booking: Booking,
    pub other_party_id: Ulid,
    pub last_message: Option<BookingMessage>,
    pub unread: bool,
}

impl ConversationSummary {
    pub fn last_activity(&self) -> Ms {
        self.last_message
            .as_ref()
            .map_or(self.booking.span.start, |m| m.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            instructor_id: Ulid::new(),
            member_id: Ulid::new(),
            span: Span::new(start, end),
            status,
            notes: None,
            cancelled_at: None,
            cancelled_by: None,
            cancellation_reason: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(Span::new(0, 400).contains_span(&a));
        assert!(!a.contains_span(&b));
    }

    #[test]
    fn civil_time_parsing() {
        assert_eq!("10:00".parse::<CivilTime>().unwrap().minutes(), 600);
        assert_eq!("09:30:00".parse::<CivilTime>().unwrap(), CivilTime::hm(9, 30));
        assert_eq!("24:00".parse::<CivilTime>().unwrap().minutes(), MINUTES_PER_DAY);
        assert!("24:01".parse::<CivilTime>().is_err());
        assert!("10:60".parse::<CivilTime>().is_err());
        assert!("10:00:30".parse::<CivilTime>().is_err());
        assert!("ten".parse::<CivilTime>().is_err());
        assert_eq!(CivilTime::hm(7, 5).to_string(), "07:05");
    }

    #[test]
    fn civil_time_json() {
        let t: CivilTime = serde_json::from_str("\"13:45\"").unwrap();
        assert_eq!(t, CivilTime::hm(13, 45));
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"13:45\"");
    }

    #[test]
    fn weekday_numbering_starts_sunday() {
        let sunday = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
        assert_eq!(day_of_week(sunday), 0);
        assert_eq!(day_of_week(sunday.succ_opt().unwrap()), 1);
    }

    #[test]
    fn status_transition_table() {
        use BookingStatus::*;
        assert!(Pending.can_become(Confirmed));
        assert!(Pending.can_become(Expired));
        assert!(!Pending.can_become(Completed));
        assert!(Confirmed.can_become(NoShow));
        assert!(!Confirmed.can_become(Declined));
        for terminal in [Declined, Expired, CancelledByMember, CancelledByInstructor, Completed, NoShow] {
            assert!(terminal.is_terminal());
            for next in [Pending, Confirmed, Declined, Completed] {
                assert!(!terminal.can_become(next));
            }
        }
    }

    #[test]
    fn status_strings() {
        assert_eq!("no_show".parse::<BookingStatus>().unwrap(), BookingStatus::NoShow);
        assert_eq!(BookingStatus::CancelledByMember.to_string(), "cancelled_by_member");
        assert!("gone".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn window_effective_bounds() {
        let monday = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let mut w = AvailabilityWindow {
            id: Ulid::new(),
            instructor_id: Ulid::new(),
            day_of_week: 1,
            start: CivilTime::hm(10, 0),
            end: CivilTime::hm(14, 0),
            slot_minutes: 60,
            is_active: true,
            effective_from: None,
            effective_until: None,
            created_at: 0,
            updated_at: 0,
        };
        assert!(w.applies_on(monday));
        assert!(!w.applies_on(monday.succ_opt().unwrap()));
        w.effective_from = monday.succ_opt();
        assert!(!w.applies_on(monday));
        w.effective_from = None;
        w.effective_until = monday.pred_opt();
        assert!(!w.applies_on(monday));
        w.effective_until = None;
        w.is_active = false;
        assert!(!w.applies_on(monday));
    }

    #[test]
    fn bookings_kept_sorted_and_overlap_query() {
        let mut cal = InstructorCalendar::new(Ulid::new());
        cal.insert_booking(booking(300, 400, BookingStatus::Pending));
        cal.insert_booking(booking(100, 200, BookingStatus::Declined));
        cal.insert_booking(booking(200, 300, BookingStatus::Confirmed));
        let starts: Vec<Ms> = cal.bookings.iter().map(|b| b.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);

        let hits: Vec<_> = cal.overlapping(&Span::new(150, 350)).collect();
        assert_eq!(hits.len(), 3);
        let active: Vec<_> = cal.active_overlapping(&Span::new(150, 350)).collect();
        assert_eq!(active.len(), 2);
        // adjacent is not overlapping
        assert_eq!(cal.overlapping(&Span::new(400, 500)).count(), 0);
    }

    #[test]
    fn profile_name_falls_back_to_full_name() {
        let mut p = Profile {
            id: Ulid::new(),
            display_name: Some("  ".into()),
            full_name: Some("Ana Pavlova".into()),
            avatar_url: None,
        };
        assert_eq!(p.name(), Some("Ana Pavlova"));
        p.display_name = Some("Ana".into());
        assert_eq!(p.name(), Some("Ana"));
        p.display_name = None;
        p.full_name = None;
        assert_eq!(p.name(), None);
    }

    #[test]
    fn caller_authority() {
        let instructor = Ulid::new();
        assert!(Caller::new(instructor, Role::Instructor).manages(instructor));
        assert!(Caller::new(Ulid::new(), Role::Owner).manages(instructor));
        assert!(!Caller::new(Ulid::new(), Role::Staff).manages(instructor));
        assert!(!Caller::new(instructor, Role::Guest).manages(instructor));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::OverrideAdded(AvailabilityOverride {
            id: Ulid::new(),
            instructor_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2026, 12, 24).unwrap(),
            start: None,
            end: None,
            is_available: false,
            reason: Some("holiday".into()),
            slot_minutes: 60,
            created_at: 1,
        });
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
