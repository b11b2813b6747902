use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Invalid("start_time must be before end_time".into()));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_LESSON_DURATION_MS {
        return Err(EngineError::LimitExceeded("lesson too long"));
    }
    Ok(())
}

/// Trim and bound optional free text; blank becomes `None`.
pub(crate) fn clean_text(
    text: Option<String>,
    max_chars: usize,
    what: &'static str,
) -> Result<Option<String>, EngineError> {
    let Some(text) = text else { return Ok(None) };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > max_chars {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(Some(trimmed.to_string()))
}

pub(crate) fn validate_slot_minutes(minutes: u16) -> Result<(), EngineError> {
    if !(MIN_SLOT_MINUTES..=MAX_SLOT_MINUTES).contains(&minutes) {
        return Err(EngineError::Invalid(format!(
            "slot_duration_minutes must be between {MIN_SLOT_MINUTES} and {MAX_SLOT_MINUTES}"
        )));
    }
    Ok(())
}

pub(crate) fn validate_civil_window(start: CivilTime, end: CivilTime) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::Invalid("start_time must be before end_time".into()));
    }
    Ok(())
}

/// Any pending or confirmed booking overlapping `span` is a conflict.
pub(crate) fn check_no_conflict(cal: &InstructorCalendar, span: &Span) -> Result<(), EngineError> {
    match cal.active_overlapping(span).next() {
        Some(existing) => Err(EngineError::SlotTaken(existing.id)),
        None => Ok(()),
    }
}

pub(crate) fn require_manager(
    caller: &Caller,
    instructor_id: ulid::Ulid,
    action: &'static str,
) -> Result<(), EngineError> {
    if caller.manages(instructor_id) {
        Ok(())
    } else {
        Err(EngineError::Forbidden(action))
    }
}

/// Reject moves the transition table does not allow.
pub(crate) fn check_transition(
    booking: &Booking,
    to: BookingStatus,
    action: &'static str,
) -> Result<(), EngineError> {
    if booking.status.can_become(to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition {
            from: booking.status,
            action,
        })
    }
}

/// Who may cancel and which cancelled state results.
pub(crate) fn cancellation_status(
    booking: &Booking,
    caller: &Caller,
    now: Ms,
) -> Result<BookingStatus, EngineError> {
    let on_behalf_of_studio = !booking.is_participant(caller.id) && caller.role.is_studio();
    if !booking.is_participant(caller.id) && !on_behalf_of_studio {
        return Err(EngineError::Forbidden("cancel this booking"));
    }
    // Only a non-participant acting for the studio skips the notice window;
    // a participant is bound by it whatever their role.
    if !on_behalf_of_studio {
        let starts_in_ms = booking.span.start - now;
        if starts_in_ms < CANCELLATION_NOTICE_MS {
            return Err(EngineError::NoticeWindow { starts_in_ms });
        }
    }
    if caller.id == booking.member_id {
        Ok(BookingStatus::CancelledByMember)
    } else {
        Ok(BookingStatus::CancelledByInstructor)
    }
}
