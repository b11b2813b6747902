use std::collections::HashSet;

use chrono::NaiveDate;
use serde::Deserialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::SlotGenerator;
use super::{Engine, EngineError};

/// Which side of a booking the caller wants to see.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingRole {
    Teaching,
    Attending,
    #[default]
    All,
}

/// Inclusive civil date range, bounded in width.
pub fn check_date_range(first: NaiveDate, last: NaiveDate) -> Result<(), EngineError> {
    if last < first {
        return Err(EngineError::Invalid("end date is before start date".into()));
    }
    if (last - first).num_days() >= MAX_QUERY_DAYS {
        return Err(EngineError::LimitExceeded("date range too wide"));
    }
    Ok(())
}

impl Engine {
    /// Weekly windows, sorted by (day_of_week, start_time).
    pub async fn list_windows(&self, instructor_id: &Ulid) -> Vec<AvailabilityWindow> {
        match self.store.calendar(instructor_id) {
            Some(cal) => cal.read().await.windows.clone(),
            None => Vec::new(),
        }
    }

    pub async fn list_overrides(
        &self,
        instructor_id: &Ulid,
        first: NaiveDate,
        last: NaiveDate,
    ) -> Result<Vec<AvailabilityOverride>, EngineError> {
        check_date_range(first, last)?;
        let Some(cal) = self.store.calendar(instructor_id) else {
            return Ok(Vec::new());
        };
        let guard = cal.read().await;
        Ok(guard
            .overrides
            .iter()
            .filter(|o| o.date >= first && o.date <= last)
            .cloned()
            .collect())
    }

    /// Free slots over an inclusive date range in the studio's zone.
    pub async fn available_slots(
        &self,
        instructor_id: &Ulid,
        first: NaiveDate,
        last: NaiveDate,
        now: Ms,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        check_date_range(first, last)?;
        let Some(cal) = self.store.calendar(instructor_id) else {
            return Ok(Vec::new());
        };
        let guard = cal.read().await;
        Ok(SlotGenerator::new(&guard, self.timezone(), first, last, now)
            .iter()
            .collect())
    }

    /// Snapshot of a booking without any visibility check.
    pub(super) async fn find_booking(&self, booking_id: &Ulid) -> Result<Booking, EngineError> {
        let (_, cal) = self.calendar_for_entity(booking_id)?;
        let guard = cal.read().await;
        guard
            .booking(*booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(*booking_id))
    }

    pub async fn get_booking(&self, caller: &Caller, booking_id: &Ulid) -> Result<Booking, EngineError> {
        let booking = self.find_booking(booking_id).await?;
        if !booking.visible_to(caller) {
            return Err(EngineError::Forbidden("view this booking"));
        }
        Ok(booking)
    }

    /// The caller's own bookings, ordered by start time.
    pub async fn list_bookings(
        &self,
        caller: &Caller,
        role: BookingRole,
        status: Option<BookingStatus>,
    ) -> Vec<Booking> {
        let mut out = Vec::new();
        if matches!(role, BookingRole::Teaching | BookingRole::All)
            && let Some(cal) = self.store.calendar(&caller.id)
        {
            out.extend(cal.read().await.bookings.iter().cloned());
        }
        if matches!(role, BookingRole::Attending | BookingRole::All) {
            let mut seen: HashSet<Ulid> = out.iter().map(|b| b.id).collect();
            for booking_id in self.store.bookings_of_member(&caller.id) {
                if !seen.insert(booking_id) {
                    continue;
                }
                if let Ok(booking) = self.find_booking(&booking_id).await {
                    out.push(booking);
                }
            }
        }
        if let Some(status) = status {
            out.retain(|b| b.status == status);
        }
        out.sort_by_key(|b| (b.span.start, b.id));
        out
    }

    /// The caller's bookings that overlap `window`, for the schedule view.
    pub async fn bookings_overlapping(&self, caller: &Caller, window: &Span) -> Vec<Booking> {
        let mut bookings = self.list_bookings(caller, BookingRole::All, None).await;
        bookings.retain(|b| b.span.overlaps(window));
        bookings
    }
}
