//! HTTP surface of the booking core.

mod dto;
mod error;
mod extract;
mod realtime;

pub use error::HttpError;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{MatchedPath, Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::json;
use tokio::sync::Semaphore;
use ulid::Ulid;

use crate::auth::check_bearer;
use crate::engine::{NewBooking, NewOverride, NewWindow, check_date_range, local_instant, now_ms};
use crate::model::{Span, utc_instant};
use crate::observability::{
    HTTP_REQUEST_DURATION_SECONDS, HTTP_REQUESTS_REJECTED_TOTAL, HTTP_REQUESTS_TOTAL,
};
use crate::schedule::{BookingWithParties, CalendarFeed, build_schedule};
use crate::tenant::TenantManager;

use dto::*;
use extract::{Identity, JsonBody, QueryParams, Studio, optional_json, parse_id};

#[derive(Clone)]
pub struct AppState {
    pub tenants: Arc<TenantManager>,
    pub feed: Arc<dyn CalendarFeed>,
    /// Bearer secret for the sweep endpoint. `None` locks the endpoint.
    pub cron_secret: Option<Arc<str>>,
}

pub fn router(state: AppState, max_in_flight: usize) -> Router {
    let internal = Router::new()
        .route("/internal/expire-bookings", post(expire_bookings))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_cron_secret,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/profile", put(upsert_profile))
        .route("/instructors/{id}/availability", get(list_windows))
        .route("/instructors/{id}/overrides", get(list_overrides))
        .route("/instructors/{id}/slots", get(available_slots))
        .route("/availability", post(add_window))
        .route("/availability/{id}", delete(remove_window))
        .route("/overrides", post(add_override))
        .route("/overrides/{id}", delete(remove_override))
        .route("/bookings", post(create_booking).get(list_bookings))
        .route("/bookings/{id}", get(get_booking))
        .route("/bookings/{id}/confirm", post(confirm_booking))
        .route("/bookings/{id}/decline", post(decline_booking))
        .route("/bookings/{id}/cancel", post(cancel_booking))
        .route("/bookings/{id}/complete", post(complete_booking))
        .route("/bookings/{id}/no-show", post(mark_no_show))
        .route("/bookings/{id}/messages", get(list_messages).post(send_message))
        .route("/messages/unread", get(unread))
        .route("/messages/conversations", get(conversations))
        .route("/schedule", get(schedule))
        .route("/realtime", get(realtime::subscribe))
        .merge(internal)
        .layer(middleware::from_fn(track_metrics))
        .layer(middleware::from_fn_with_state(
            Arc::new(Semaphore::new(max_in_flight)),
            limit_in_flight,
        ))
        .with_state(state)
}

// ── Middleware ───────────────────────────────────────────────────

async fn track_metrics(req: Request, next: Next) -> Response {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let method = req.method().clone();
    let started = Instant::now();

    let response = next.run(req).await;

    let status = response.status().as_u16();
    metrics::counter!(HTTP_REQUESTS_TOTAL, "route" => route.clone(), "status" => status.to_string())
        .increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION_SECONDS, "route" => route.clone())
        .record(started.elapsed().as_secs_f64());
    tracing::debug!(%method, %route, status, "request served");
    response
}

/// Shed load instead of queueing once `max_in_flight` requests are running.
async fn limit_in_flight(
    State(permits): State<Arc<Semaphore>>,
    req: Request,
    next: Next,
) -> Result<Response, HttpError> {
    let Ok(_permit) = permits.try_acquire_owned() else {
        tracing::warn!(uri = %req.uri(), "in-flight limit reached, rejecting request");
        metrics::counter!(HTTP_REQUESTS_REJECTED_TOTAL).increment(1);
        return Err(HttpError::unavailable("server busy, retry shortly"));
    };
    Ok(next.run(req).await)
}

async fn require_cron_secret(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, HttpError> {
    check_bearer(req.headers(), state.cron_secret.as_deref())?;
    Ok(next.run(req).await)
}

// ── Handlers ─────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "studios": state.tenants.studios().len() }))
}

async fn upsert_profile(
    Identity(caller): Identity,
    studio: Studio,
    JsonBody(req): JsonBody<ProfileRequest>,
) -> Result<Json<ProfileView>, HttpError> {
    let profile = studio
        .engine
        .upsert_profile(&caller, req.display_name, req.full_name, req.avatar_url)
        .await?;
    Ok(Json(profile.into()))
}

async fn list_windows(
    Identity(_caller): Identity,
    studio: Studio,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let instructor_id = parse_id(&id)?;
    let windows: Vec<WindowView> = studio
        .engine
        .list_windows(&instructor_id)
        .await
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(json!({ "windows": windows })))
}

async fn add_window(
    Identity(caller): Identity,
    studio: Studio,
    JsonBody(req): JsonBody<WindowRequest>,
) -> Result<impl IntoResponse, HttpError> {
    let window = studio
        .engine
        .add_window(
            &caller,
            NewWindow {
                instructor_id: req.instructor_id.unwrap_or(caller.id),
                day_of_week: req.day_of_week,
                start: req.start_time,
                end: req.end_time,
                slot_minutes: req.slot_duration_minutes,
                is_active: req.is_active,
                effective_from: req.effective_from,
                effective_until: req.effective_until,
            },
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "window": WindowView::from(window) })),
    ))
}

async fn remove_window(
    Identity(caller): Identity,
    studio: Studio,
    Path(id): Path<String>,
) -> Result<Json<WindowRemovedView>, HttpError> {
    let window_id = parse_id(&id)?;
    let removal = studio
        .engine
        .remove_window(&caller, window_id, now_ms())
        .await?;
    Ok(Json(removal.into()))
}

async fn list_overrides(
    Identity(_caller): Identity,
    studio: Studio,
    Path(id): Path<String>,
    QueryParams(range): QueryParams<DateRange>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let instructor_id = parse_id(&id)?;
    let overrides: Vec<OverrideView> = studio
        .engine
        .list_overrides(&instructor_id, range.start, range.end)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(json!({ "overrides": overrides })))
}

async fn add_override(
    Identity(caller): Identity,
    studio: Studio,
    JsonBody(req): JsonBody<OverrideRequest>,
) -> Result<impl IntoResponse, HttpError> {
    let ov = studio
        .engine
        .add_override(
            &caller,
            NewOverride {
                instructor_id: req.instructor_id.unwrap_or(caller.id),
                date: req.override_date,
                start: req.start_time,
                end: req.end_time,
                is_available: req.is_available,
                reason: req.reason,
                slot_minutes: req.slot_duration_minutes,
            },
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "override": OverrideView::from(ov) })),
    ))
}

async fn remove_override(
    Identity(caller): Identity,
    studio: Studio,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let override_id = parse_id(&id)?;
    studio.engine.remove_override(&caller, override_id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn available_slots(
    Identity(_caller): Identity,
    studio: Studio,
    Path(id): Path<String>,
    QueryParams(range): QueryParams<DateRange>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let instructor_id = parse_id(&id)?;
    let slots: Vec<SlotView> = studio
        .engine
        .available_slots(&instructor_id, range.start, range.end, now_ms())
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(json!({ "slots": slots })))
}

async fn create_booking(
    Identity(caller): Identity,
    studio: Studio,
    JsonBody(req): JsonBody<BookingRequest>,
) -> Result<impl IntoResponse, HttpError> {
    // Built field by field: the engine rejects an inverted range itself.
    let span = Span {
        start: req.start_time.timestamp_millis(),
        end: req.end_time.timestamp_millis(),
    };
    let booking = studio
        .engine
        .create_booking(
            &caller,
            NewBooking {
                instructor_id: req.instructor_id,
                span,
                notes: req.notes,
            },
            now_ms(),
        )
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "booking_id": booking.id,
            "booking": BookingView::from(booking),
        })),
    ))
}

async fn list_bookings(
    Identity(caller): Identity,
    studio: Studio,
    QueryParams(filter): QueryParams<BookingFilter>,
) -> Json<serde_json::Value> {
    let bookings: Vec<BookingView> = studio
        .engine
        .list_bookings(&caller, filter.role, filter.status)
        .await
        .into_iter()
        .map(Into::into)
        .collect();
    Json(json!({ "bookings": bookings }))
}

async fn get_booking(
    Identity(caller): Identity,
    studio: Studio,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let booking = studio.engine.get_booking(&caller, &parse_id(&id)?).await?;
    Ok(Json(json!({ "booking": BookingView::from(booking) })))
}

fn transitioned(booking: crate::model::Booking) -> Json<serde_json::Value> {
    Json(json!({ "success": true, "booking": BookingView::from(booking) }))
}

async fn confirm_booking(
    Identity(caller): Identity,
    studio: Studio,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let booking = studio
        .engine
        .confirm_booking(&caller, parse_id(&id)?, now_ms())
        .await?;
    Ok(transitioned(booking))
}

async fn decline_booking(
    Identity(caller): Identity,
    studio: Studio,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let booking = studio
        .engine
        .decline_booking(&caller, parse_id(&id)?, now_ms())
        .await?;
    Ok(transitioned(booking))
}

async fn cancel_booking(
    Identity(caller): Identity,
    studio: Studio,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, HttpError> {
    let booking_id = parse_id(&id)?;
    let req: CancelRequest = optional_json(&body)?;
    let booking = studio
        .engine
        .cancel_booking(&caller, booking_id, req.reason, now_ms())
        .await?;
    Ok(transitioned(booking))
}

async fn complete_booking(
    Identity(caller): Identity,
    studio: Studio,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let booking = studio
        .engine
        .complete_booking(&caller, parse_id(&id)?, now_ms())
        .await?;
    Ok(transitioned(booking))
}

async fn mark_no_show(
    Identity(caller): Identity,
    studio: Studio,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let booking = studio
        .engine
        .mark_no_show(&caller, parse_id(&id)?, now_ms())
        .await?;
    Ok(transitioned(booking))
}

async fn list_messages(
    Identity(caller): Identity,
    studio: Studio,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let messages: Vec<MessageView> = studio
        .engine
        .list_messages(&caller, &parse_id(&id)?, now_ms())
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(Json(json!({ "messages": messages })))
}

async fn send_message(
    Identity(caller): Identity,
    studio: Studio,
    Path(id): Path<String>,
    JsonBody(req): JsonBody<MessageRequest>,
) -> Result<impl IntoResponse, HttpError> {
    let booking_id = parse_id(&id)?;
    let message = studio
        .engine
        .send_message(&caller, &booking_id, &req.content, now_ms())
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "message": MessageView::from(message) })),
    ))
}

async fn unread(Identity(caller): Identity, studio: Studio) -> Json<serde_json::Value> {
    let engine = &studio.engine;
    let rows: Vec<UnreadView> = engine
        .unread_summaries(&caller)
        .await
        .into_iter()
        .map(|row| UnreadView {
            booking_id: row.booking_id,
            other_party: PartyView::resolve(engine, row.other_party_id),
            last_message: row.last_message.into(),
        })
        .collect();
    Json(json!({ "count": rows.len(), "unread": rows }))
}

async fn conversations(Identity(caller): Identity, studio: Studio) -> Json<serde_json::Value> {
    let engine = &studio.engine;
    let rows: Vec<ConversationView> = engine
        .conversations(&caller)
        .await
        .into_iter()
        .map(|row| ConversationView {
            last_activity: utc_instant(row.last_activity()),
            other_party: PartyView::resolve(engine, row.other_party_id),
            unread: row.unread,
            last_message: row.last_message.map(Into::into),
            booking: row.booking.into(),
        })
        .collect();
    Json(json!({ "conversations": rows }))
}

async fn schedule(
    Identity(caller): Identity,
    State(state): State<AppState>,
    studio: Studio,
    QueryParams(range): QueryParams<DateRange>,
) -> Result<Json<ScheduleView>, HttpError> {
    check_date_range(range.start, range.end)?;
    let engine = &studio.engine;
    let tz = engine.timezone();
    let after_last = range
        .end
        .succ_opt()
        .ok_or_else(|| HttpError::bad_request("end date out of range"))?;
    let (Some(start), Some(end)) = (
        local_instant(tz, range.start, 0),
        local_instant(tz, after_last, 0),
    ) else {
        return Err(HttpError::bad_request("date range has no local midnight"));
    };
    let window = Span { start, end };

    let bookings: Vec<BookingWithParties> = engine
        .bookings_overlapping(&caller, &window)
        .await
        .into_iter()
        .map(|booking| BookingWithParties {
            instructor: engine.profile(&booking.instructor_id),
            member: engine.profile(&booking.member_id),
            booking,
        })
        .collect();
    let unread: HashSet<Ulid> = engine
        .unread_summaries(&caller)
        .await
        .into_iter()
        .map(|row| row.booking_id)
        .collect();

    let (events, events_unavailable) = match state
        .feed
        .events_between(&studio.name, utc_instant(start), utc_instant(end))
        .await
    {
        Ok(events) => (events, false),
        Err(e) => {
            tracing::warn!(studio = %studio.name, "schedule without events: {e}");
            (Vec::new(), true)
        }
    };

    Ok(Json(ScheduleView {
        items: build_schedule(&events, &bookings, caller.id, &unread),
        events_unavailable,
    }))
}

async fn expire_bookings(State(state): State<AppState>) -> Json<SweepView> {
    let (expired, error) = state.tenants.sweep_all(now_ms()).await;
    match error {
        None => {
            tracing::info!(expired, "expiry sweep finished");
            Json(SweepView { expired, error: None })
        }
        // The scheduler only sees a failed run; what did expire stays in the log.
        Some(e) => {
            tracing::error!(expired, "expiry sweep failed: {e}");
            Json(SweepView {
                expired: 0,
                error: Some(e.to_string()),
            })
        }
    }
}
