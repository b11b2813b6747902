use ulid::Ulid;

use crate::model::{BookingStatus, Ms};

/// Coarse classification the transport maps to status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Authorization,
    Conflict,
    Validation,
    NotFound,
    Transient,
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    /// Caller lacks the relationship the action needs.
    Forbidden(&'static str),
    /// Participant cancellation inside the minimum-notice window.
    NoticeWindow { starts_in_ms: Ms },
    /// Another active booking holds part of the requested time.
    SlotTaken(Ulid),
    /// Requested time is not offered by the instructor's availability.
    SlotUnavailable,
    InvalidTransition {
        from: BookingStatus,
        action: &'static str,
    },
    /// Completion or no-show recorded before the lesson began.
    NotStarted(Ulid),
    DuplicateWindow(Ulid),
    DuplicateOverride(Ulid),
    Invalid(String),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Forbidden(_) | EngineError::NoticeWindow { .. } => {
                ErrorKind::Authorization
            }
            EngineError::SlotTaken(_)
            | EngineError::SlotUnavailable
            | EngineError::InvalidTransition { .. }
            | EngineError::NotStarted(_)
            | EngineError::DuplicateWindow(_)
            | EngineError::DuplicateOverride(_) => ErrorKind::Conflict,
            EngineError::Invalid(_) | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::WalError(_) => ErrorKind::Transient,
        }
    }

    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::NoticeWindow { .. } => "notice_window",
            EngineError::SlotTaken(_) => "slot_taken",
            EngineError::SlotUnavailable => "slot_unavailable",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::NotStarted(_) => "not_started",
            EngineError::DuplicateWindow(_) => "duplicate_window",
            EngineError::DuplicateOverride(_) => "duplicate_override",
            EngineError::Invalid(_) => "invalid",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "unavailable",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Forbidden(what) => write!(f, "not authorized to {what}"),
            EngineError::NoticeWindow { starts_in_ms } => write!(
                f,
                "cannot cancel within 24 hours of the lesson (starts in {} minutes)",
                starts_in_ms / 60_000
            ),
            EngineError::SlotTaken(id) => {
                write!(f, "time slot is no longer available (held by booking {id})")
            }
            EngineError::SlotUnavailable => {
                write!(f, "requested time is not within the instructor's availability")
            }
            EngineError::InvalidTransition { from, action } => {
                write!(f, "cannot {action} a booking that is {from}")
            }
            EngineError::NotStarted(id) => write!(f, "lesson has not started yet: {id}"),
            EngineError::DuplicateWindow(id) => {
                write!(f, "availability window already exists: {id}")
            }
            EngineError::DuplicateOverride(id) => {
                write!(f, "override already exists for that date: {id}")
            }
            EngineError::Invalid(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_partition_variants() {
        assert_eq!(EngineError::Forbidden("confirm").kind(), ErrorKind::Authorization);
        assert_eq!(
            EngineError::NoticeWindow { starts_in_ms: 0 }.kind(),
            ErrorKind::Authorization
        );
        assert_eq!(EngineError::SlotUnavailable.kind(), ErrorKind::Conflict);
        assert_eq!(
            EngineError::InvalidTransition {
                from: BookingStatus::Declined,
                action: "confirm"
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert_eq!(EngineError::LimitExceeded("x").kind(), ErrorKind::Validation);
        assert_eq!(EngineError::NotFound(Ulid::new()).kind(), ErrorKind::NotFound);
        assert_eq!(EngineError::WalError("disk".into()).kind(), ErrorKind::Transient);
    }

    #[test]
    fn notice_window_is_distinct_from_plain_forbidden() {
        let notice = EngineError::NoticeWindow { starts_in_ms: 90 * 60_000 };
        assert_eq!(notice.code(), "notice_window");
        assert!(notice.to_string().contains("24 hours"));
        assert!(notice.to_string().contains("90 minutes"));
        assert_ne!(notice.code(), EngineError::Forbidden("cancel").code());
    }

    #[test]
    fn transition_message_names_state() {
        let e = EngineError::InvalidTransition {
            from: BookingStatus::Confirmed,
            action: "confirm",
        };
        assert_eq!(e.to_string(), "cannot confirm a booking that is confirmed");
    }
}
