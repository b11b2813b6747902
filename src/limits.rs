use crate::model::Ms;

pub const MINUTE_MS: Ms = 60_000;
pub const HOUR_MS: Ms = 60 * MINUTE_MS;

/// A pending request nobody answered within this window is expired by the sweeper.
pub const PENDING_EXPIRY_MS: Ms = 4 * HOUR_MS;

/// Participants cannot cancel a lesson that starts sooner than this.
pub const CANCELLATION_NOTICE_MS: Ms = 24 * HOUR_MS;

pub const MAX_MESSAGE_LEN: usize = 2000;
pub const MAX_NOTES_LEN: usize = 1000;
pub const MAX_REASON_LEN: usize = 500;
pub const MAX_NAME_LEN: usize = 200;
pub const MAX_URL_LEN: usize = 2048;

pub const MIN_SLOT_MINUTES: u16 = 5;
pub const MAX_SLOT_MINUTES: u16 = 480;

/// Widest date range a slot or schedule query may cover (inclusive days).
pub const MAX_QUERY_DAYS: i64 = 93;

pub const MAX_WINDOWS_PER_INSTRUCTOR: usize = 200;
pub const MAX_OVERRIDES_PER_INSTRUCTOR: usize = 2000;
pub const MAX_MESSAGES_PER_BOOKING: usize = 10_000;

pub const MAX_TENANTS: usize = 1000;
pub const MAX_TENANT_NAME_LEN: usize = 64;

/// 2000-01-01T00:00:00Z .. 2200-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
pub const MAX_LESSON_DURATION_MS: Ms = 8 * HOUR_MS;
