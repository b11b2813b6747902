use std::fmt;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use ulid::Ulid;

use crate::model::{Caller, Role};
use crate::observability::AUTH_FAILURES_TOTAL;

/// Identity headers set by the upstream gateway after it authenticated the user.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";
/// Selects the studio (tenant) a request belongs to.
pub const STUDIO_HEADER: &str = "x-studio";
pub const DEFAULT_STUDIO: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    MissingIdentity,
    MalformedIdentity(String),
    BadToken,
}

impl AuthError {
    /// Metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingIdentity => "missing_identity",
            AuthError::MalformedIdentity(_) => "malformed_identity",
            AuthError::BadToken => "bad_token",
        }
    }

    fn counted(self) -> Self {
        metrics::counter!(AUTH_FAILURES_TOTAL, "reason" => self.reason()).increment(1);
        self
    }
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingIdentity => write!(f, "authentication required"),
            AuthError::MalformedIdentity(why) => write!(f, "malformed identity: {why}"),
            AuthError::BadToken => write!(f, "unauthorized"),
        }
    }
}

impl std::error::Error for AuthError {}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Read the forwarded identity. Both headers are required.
pub fn caller_from_headers(headers: &HeaderMap) -> Result<Caller, AuthError> {
    let (Some(id), Some(role)) = (header(headers, USER_ID_HEADER), header(headers, USER_ROLE_HEADER))
    else {
        return Err(AuthError::MissingIdentity.counted());
    };
    let id = Ulid::from_string(id)
        .map_err(|e| AuthError::MalformedIdentity(format!("{USER_ID_HEADER}: {e}")).counted())?;
    let role: Role = role
        .parse()
        .map_err(|e: String| AuthError::MalformedIdentity(e).counted())?;
    Ok(Caller::new(id, role))
}

pub fn studio_from_headers(headers: &HeaderMap) -> &str {
    header(headers, STUDIO_HEADER).unwrap_or(DEFAULT_STUDIO)
}

/// Check `Authorization: Bearer <secret>`. With no secret configured nothing passes.
pub fn check_bearer(headers: &HeaderMap, secret: Option<&str>) -> Result<(), AuthError> {
    let presented = header(headers, AUTHORIZATION.as_str()).and_then(|v| v.strip_prefix("Bearer "));
    match (secret, presented) {
        (Some(secret), Some(token)) if constant_time_eq(secret.as_bytes(), token.trim().as_bytes()) => {
            Ok(())
        }
        _ => Err(AuthError::BadToken.counted()),
    }
}

/// Compares every byte regardless of where the first mismatch is.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
