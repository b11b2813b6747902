use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::{check_within_availability, local_placement};
use super::conflict::{
    cancellation_status, check_no_conflict, check_transition, clean_text, now_ms,
    require_manager, validate_civil_window, validate_slot_minutes, validate_span,
};
use super::{Engine, EngineError};

/// Input for a new weekly window.
#[derive(Debug, Clone)]
pub struct NewWindow {
    pub instructor_id: Ulid,
    pub day_of_week: u8,
    pub start: CivilTime,
    pub end: CivilTime,
    pub slot_minutes: u16,
    pub is_active: bool,
    pub effective_from: Option<NaiveDate>,
    pub effective_until: Option<NaiveDate>,
}

/// Input for a new date override.
#[derive(Debug, Clone)]
pub struct NewOverride {
    pub instructor_id: Ulid,
    pub date: NaiveDate,
    pub start: Option<CivilTime>,
    pub end: Option<CivilTime>,
    pub is_available: bool,
    pub reason: Option<String>,
    pub slot_minutes: u16,
}

/// Input for a lesson request.
#[derive(Debug, Clone)]
pub struct NewBooking {
    pub instructor_id: Ulid,
    pub span: Span,
    pub notes: Option<String>,
}

const CASCADE_REASON: &str = "availability window removed";

impl Engine {
    // ── Profiles ─────────────────────────────────────────────

    pub async fn upsert_profile(
        &self,
        caller: &Caller,
        display_name: Option<String>,
        full_name: Option<String>,
        avatar_url: Option<String>,
    ) -> Result<Profile, EngineError> {
        let profile = Profile {
            id: caller.id,
            display_name: clean_text(display_name, MAX_NAME_LEN, "display name too long")?,
            full_name: clean_text(full_name, MAX_NAME_LEN, "full name too long")?,
            avatar_url: clean_text(avatar_url, MAX_URL_LEN, "avatar url too long")?,
        };
        let _commit = self.commit_gate.read().await;
        self.persist_shared(&Event::ProfileUpserted(profile.clone()))
            .await?;
        Ok(profile)
    }

    // ── Weekly windows ───────────────────────────────────────

    pub async fn add_window(
        &self,
        caller: &Caller,
        new: NewWindow,
    ) -> Result<AvailabilityWindow, EngineError> {
        require_manager(caller, new.instructor_id, "manage this instructor's availability")?;
        if new.day_of_week > 6 {
            return Err(EngineError::Invalid("day_of_week must be 0-6".into()));
        }
        validate_civil_window(new.start, new.end)?;
        validate_slot_minutes(new.slot_minutes)?;
        if let (Some(from), Some(until)) = (new.effective_from, new.effective_until)
            && from > until
        {
            return Err(EngineError::Invalid(
                "effective_from must not be after effective_until".into(),
            ));
        }

        let _commit = self.commit_gate.read().await;
        let cal = self.store.calendar_or_create(new.instructor_id);
        let mut guard = cal.write().await;
        if guard.windows.len() >= MAX_WINDOWS_PER_INSTRUCTOR {
            return Err(EngineError::LimitExceeded("too many availability windows"));
        }
        if let Some(existing) = guard
            .windows
            .iter()
            .find(|w| w.day_of_week == new.day_of_week && w.start == new.start)
        {
            return Err(EngineError::DuplicateWindow(existing.id));
        }

        let now = now_ms();
        let window = AvailabilityWindow {
            id: Ulid::new(),
            instructor_id: new.instructor_id,
            day_of_week: new.day_of_week,
            start: new.start,
            end: new.end,
            slot_minutes: new.slot_minutes,
            is_active: new.is_active,
            effective_from: new.effective_from,
            effective_until: new.effective_until,
            created_at: now,
            updated_at: now,
        };
        self.persist_calendar(&mut guard, &Event::WindowAdded(window.clone()))
            .await?;
        drop(guard);

        tracing::info!(
            instructor_id = %window.instructor_id,
            window_id = %window.id,
            day = window.day_of_week,
            start = %window.start,
            end = %window.end,
            "availability window added"
        );
        self.announce_availability(window.instructor_id);
        Ok(window)
    }

    /// Delete a weekly window and, in the same commit, decline every future
    /// pending booking that sat inside it on that weekday.
    pub async fn remove_window(
        &self,
        caller: &Caller,
        window_id: Ulid,
        now: Ms,
    ) -> Result<WindowRemoval, EngineError> {
        let _commit = self.commit_gate.read().await;
        let (instructor_id, cal) = self.calendar_for_entity(&window_id)?;
        require_manager(caller, instructor_id, "manage this instructor's availability")?;
        let mut guard = cal.write().await;
        let window = guard
            .windows
            .iter()
            .find(|w| w.id == window_id)
            .cloned()
            .ok_or(EngineError::NotFound(window_id))?;

        let tz = self.timezone();
        let (lo, hi) = (window.start.minutes() as u32, window.end.minutes() as u32);
        let mut declined = Vec::new();
        let mut confirmed_conflicts = Vec::new();
        for booking in guard
            .bookings
            .iter()
            .filter(|b| b.span.start > now && b.status.is_active())
        {
            let Some((dow, start, end)) = local_placement(tz, &booking.span) else {
                continue;
            };
            if dow != window.day_of_week || start >= hi || end <= lo {
                continue;
            }
            match booking.status {
                BookingStatus::Pending => declined.push(booking.id),
                _ => confirmed_conflicts.push(booking.id),
            }
        }

        self.persist_calendar(
            &mut guard,
            &Event::WindowRemoved {
                id: window_id,
                instructor_id,
            },
        )
        .await?;
        let mut announced = Vec::with_capacity(declined.len());
        for booking_id in &declined {
            let event = Event::BookingTransitioned {
                instructor_id,
                transition: Transition {
                    booking_id: *booking_id,
                    to: BookingStatus::Declined,
                    at: now,
                    by: Some(caller.id),
                    reason: Some(CASCADE_REASON.to_string()),
                },
            };
            self.persist_calendar(&mut guard, &event).await?;
            if let Some(b) = guard.booking(*booking_id) {
                announced.push(b.clone());
            }
        }
        drop(guard);

        metrics::counter!(observability::CASCADE_DECLINED_TOTAL).increment(declined.len() as u64);
        tracing::info!(
            %instructor_id,
            %window_id,
            declined = declined.len(),
            confirmed_conflicts = confirmed_conflicts.len(),
            "availability window removed"
        );
        self.announce_availability(instructor_id);
        for booking in &announced {
            self.announce_booking(booking);
        }
        Ok(WindowRemoval {
            window,
            declined,
            confirmed_conflicts,
        })
    }

    // ── Date overrides ───────────────────────────────────────

    pub async fn add_override(
        &self,
        caller: &Caller,
        new: NewOverride,
    ) -> Result<AvailabilityOverride, EngineError> {
        require_manager(caller, new.instructor_id, "manage this instructor's availability")?;
        match (new.start, new.end) {
            (Some(start), Some(end)) => validate_civil_window(start, end)?,
            (None, None) if new.is_available => {
                return Err(EngineError::Invalid(
                    "an available override needs start_time and end_time".into(),
                ));
            }
            (None, None) => {}
            _ => {
                return Err(EngineError::Invalid(
                    "start_time and end_time must be given together".into(),
                ));
            }
        }
        validate_slot_minutes(new.slot_minutes)?;
        let reason = clean_text(new.reason, MAX_REASON_LEN, "reason too long")?;

        let _commit = self.commit_gate.read().await;
        let cal = self.store.calendar_or_create(new.instructor_id);
        let mut guard = cal.write().await;
        if guard.overrides.len() >= MAX_OVERRIDES_PER_INSTRUCTOR {
            return Err(EngineError::LimitExceeded("too many availability overrides"));
        }
        if let Some(existing) = guard
            .overrides_on(new.date)
            .iter()
            .find(|o| o.start == new.start && o.end == new.end)
        {
            return Err(EngineError::DuplicateOverride(existing.id));
        }

        let ov = AvailabilityOverride {
            id: Ulid::new(),
            instructor_id: new.instructor_id,
            date: new.date,
            start: new.start,
            end: new.end,
            is_available: new.is_available,
            reason,
            slot_minutes: new.slot_minutes,
            created_at: now_ms(),
        };
        self.persist_calendar(&mut guard, &Event::OverrideAdded(ov.clone()))
            .await?;
        drop(guard);

        tracing::info!(
            instructor_id = %ov.instructor_id,
            override_id = %ov.id,
            date = %ov.date,
            available = ov.is_available,
            "availability override added"
        );
        self.announce_availability(ov.instructor_id);
        Ok(ov)
    }

    pub async fn remove_override(
        &self,
        caller: &Caller,
        override_id: Ulid,
    ) -> Result<AvailabilityOverride, EngineError> {
        let _commit = self.commit_gate.read().await;
        let (instructor_id, cal) = self.calendar_for_entity(&override_id)?;
        require_manager(caller, instructor_id, "manage this instructor's availability")?;
        let mut guard = cal.write().await;
        let ov = guard
            .overrides
            .iter()
            .find(|o| o.id == override_id)
            .cloned()
            .ok_or(EngineError::NotFound(override_id))?;
        self.persist_calendar(
            &mut guard,
            &Event::OverrideRemoved {
                id: override_id,
                instructor_id,
            },
        )
        .await?;
        drop(guard);

        tracing::info!(%instructor_id, %override_id, "availability override removed");
        self.announce_availability(instructor_id);
        Ok(ov)
    }

    // ── Booking lifecycle ────────────────────────────────────

    /// Request a lesson. Check and insert happen under the instructor's write
    /// lock, so two overlapping requests can never both succeed.
    pub async fn create_booking(
        &self,
        caller: &Caller,
        new: NewBooking,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        if caller.role == Role::Guest {
            return Err(EngineError::Forbidden("book lessons as a guest"));
        }
        if caller.id == new.instructor_id {
            return Err(EngineError::Invalid("cannot book a lesson with yourself".into()));
        }
        validate_span(&new.span)?;
        let notes = clean_text(new.notes, MAX_NOTES_LEN, "notes too long")?;

        let _commit = self.commit_gate.read().await;
        let cal = self
            .store
            .calendar(&new.instructor_id)
            .ok_or(EngineError::SlotUnavailable)?;
        let mut guard = cal.write().await;
        if let Err(e) = check_no_conflict(&guard, &new.span)
            .and_then(|()| check_within_availability(&guard, self.timezone(), &new.span, now))
        {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL, "code" => e.code())
                .increment(1);
            return Err(e);
        }

        let booking = Booking {
            id: Ulid::new(),
            instructor_id: new.instructor_id,
            member_id: caller.id,
            span: new.span,
            status: BookingStatus::Pending,
            notes,
            cancelled_at: None,
            cancelled_by: None,
            cancellation_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.persist_calendar(&mut guard, &Event::BookingRequested(booking.clone()))
            .await?;
        drop(guard);

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        tracing::info!(
            booking_id = %booking.id,
            instructor_id = %booking.instructor_id,
            member_id = %booking.member_id,
            start = booking.span.start,
            "booking requested"
        );
        self.announce_booking(&booking);
        Ok(booking)
    }

    pub async fn confirm_booking(
        &self,
        caller: &Caller,
        booking_id: Ulid,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        self.transition(caller, booking_id, now, |b| {
            require_manager(caller, b.instructor_id, "confirm this booking")?;
            check_transition(b, BookingStatus::Confirmed, "confirm")?;
            Ok((BookingStatus::Confirmed, None))
        })
        .await
    }

    pub async fn decline_booking(
        &self,
        caller: &Caller,
        booking_id: Ulid,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        self.transition(caller, booking_id, now, |b| {
            require_manager(caller, b.instructor_id, "decline this booking")?;
            check_transition(b, BookingStatus::Declined, "decline")?;
            Ok((BookingStatus::Declined, None))
        })
        .await
    }

    pub async fn cancel_booking(
        &self,
        caller: &Caller,
        booking_id: Ulid,
        reason: Option<String>,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        let reason = clean_text(reason, MAX_REASON_LEN, "cancellation reason too long")?;
        self.transition(caller, booking_id, now, move |b| {
            if !b.visible_to(caller) {
                return Err(EngineError::Forbidden("cancel this booking"));
            }
            if b.status.is_terminal() {
                return Err(EngineError::InvalidTransition {
                    from: b.status,
                    action: "cancel",
                });
            }
            let to = cancellation_status(b, caller, now)?;
            Ok((to, reason))
        })
        .await
    }

    pub async fn complete_booking(
        &self,
        caller: &Caller,
        booking_id: Ulid,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        self.transition(caller, booking_id, now, |b| {
            require_manager(caller, b.instructor_id, "complete this booking")?;
            check_transition(b, BookingStatus::Completed, "complete")?;
            if b.span.start > now {
                return Err(EngineError::NotStarted(b.id));
            }
            Ok((BookingStatus::Completed, None))
        })
        .await
    }

    pub async fn mark_no_show(
        &self,
        caller: &Caller,
        booking_id: Ulid,
        now: Ms,
    ) -> Result<Booking, EngineError> {
        self.transition(caller, booking_id, now, |b| {
            require_manager(caller, b.instructor_id, "mark this booking as a no-show")?;
            check_transition(b, BookingStatus::NoShow, "mark as no-show")?;
            if b.span.start > now {
                return Err(EngineError::NotStarted(b.id));
            }
            Ok((BookingStatus::NoShow, None))
        })
        .await
    }

    /// Shared path for caller-driven status changes: `decide` runs against the
    /// current booking under the write lock and names the target state.
    async fn transition<F>(
        &self,
        caller: &Caller,
        booking_id: Ulid,
        now: Ms,
        decide: F,
    ) -> Result<Booking, EngineError>
    where
        F: FnOnce(&Booking) -> Result<(BookingStatus, Option<String>), EngineError>,
    {
        let _commit = self.commit_gate.read().await;
        let (instructor_id, cal) = self.calendar_for_entity(&booking_id)?;
        let mut guard = cal.write().await;
        let current = guard
            .booking(booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let from = current.status;
        let (to, reason) = decide(current)?;

        let event = Event::BookingTransitioned {
            instructor_id,
            transition: Transition {
                booking_id,
                to,
                at: now,
                by: Some(caller.id),
                reason,
            },
        };
        self.persist_calendar(&mut guard, &event).await?;
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        drop(guard);

        metrics::counter!(observability::BOOKING_TRANSITIONS_TOTAL, "to" => to.as_str())
            .increment(1);
        tracing::info!(%booking_id, %from, %to, by = %caller.id, "booking transitioned");
        self.announce_booking(&booking);
        Ok(booking)
    }

    /// Expire every pending booking requested at least four hours before `now`.
    /// Safe to run repeatedly; a second pass finds nothing.
    pub async fn expire_stale_bookings(&self, now: Ms) -> Result<usize, EngineError> {
        let cutoff = now - PENDING_EXPIRY_MS;
        let mut expired = 0;
        for cal in self.store.calendars() {
            let _commit = self.commit_gate.read().await;
            let mut guard = cal.write().await;
            let instructor_id = guard.instructor_id;
            let stale: Vec<Ulid> = guard
                .bookings
                .iter()
                .filter(|b| b.status == BookingStatus::Pending && b.created_at <= cutoff)
                .map(|b| b.id)
                .collect();
            let mut announced = Vec::with_capacity(stale.len());
            for booking_id in stale {
                let event = Event::BookingTransitioned {
                    instructor_id,
                    transition: Transition {
                        booking_id,
                        to: BookingStatus::Expired,
                        at: now,
                        by: None,
                        reason: None,
                    },
                };
                self.persist_calendar(&mut guard, &event).await?;
                if let Some(b) = guard.booking(booking_id) {
                    announced.push(b.clone());
                }
            }
            drop(guard);
            expired += announced.len();
            for booking in &announced {
                tracing::debug!(booking_id = %booking.id, %instructor_id, "pending booking expired");
                self.announce_booking(booking);
            }
        }
        if expired > 0 {
            metrics::counter!(observability::BOOKINGS_EXPIRED_TOTAL).increment(expired as u64);
            tracing::info!(expired, "expired stale pending bookings");
        }
        Ok(expired)
    }
}
