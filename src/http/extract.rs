use std::io;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{FromRequest, FromRequestParts, Query, Request};
use axum::http::request::Parts;
use serde::de::DeserializeOwned;
use ulid::Ulid;

use super::AppState;
use super::error::HttpError;
use crate::auth::{caller_from_headers, studio_from_headers};
use crate::engine::Engine;
use crate::model::Caller;

/// The authenticated caller. Missing or malformed identity is 401.
pub struct Identity(pub Caller);

impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Identity(caller_from_headers(&parts.headers)?))
    }
}

/// The studio engine named by the `x-studio` header.
pub struct Studio {
    pub name: String,
    pub engine: Arc<Engine>,
}

impl FromRequestParts<AppState> for Studio {
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let name = studio_from_headers(&parts.headers).to_string();
        match state.tenants.get_or_create(&name) {
            Ok(engine) => Ok(Studio { name, engine }),
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                Err(HttpError::bad_request(format!("bad studio: {e}")))
            }
            Err(e) => {
                tracing::error!(studio = %name, "cannot open studio: {e}");
                Err(HttpError::unavailable(format!("studio unavailable: {e}")))
            }
        }
    }
}

/// JSON body whose rejections come back in the API's error shape.
pub struct JsonBody<T>(pub T);

impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = HttpError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(JsonBody(value)),
            Err(rejection) => Err(HttpError::bad_request(rejection.body_text())),
        }
    }
}

/// Query string in the API's error shape.
pub struct QueryParams<T>(pub T);

impl<S, T> FromRequestParts<S> for QueryParams<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = HttpError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match Query::<T>::from_request_parts(parts, state).await {
            Ok(Query(value)) => Ok(QueryParams(value)),
            Err(rejection) => Err(HttpError::bad_request(rejection.body_text())),
        }
    }
}

/// Body that may be absent; an empty body reads as `T::default()`.
pub fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, HttpError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| HttpError::bad_request(format!("invalid JSON body: {e}")))
}

pub fn parse_id(raw: &str) -> Result<Ulid, HttpError> {
    Ulid::from_string(raw).map_err(|_| HttpError::bad_request(format!("invalid id '{raw}'")))
}
