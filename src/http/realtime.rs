//! Server-sent change hints. Clients treat every event as "refetch now";
//! nothing here is authoritative, and a lagging client is told to resync.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::broadcast::error::RecvError;

use super::dto::RealtimeQuery;
use super::error::HttpError;
use super::extract::{Identity, QueryParams, Studio};
use crate::notify::{Notice, Subscription, Topic};
use crate::observability::REALTIME_STREAMS_ACTIVE;

/// Keeps the open-stream gauge honest for however the stream ends.
struct StreamGauge;

impl StreamGauge {
    fn open() -> Self {
        metrics::gauge!(REALTIME_STREAMS_ACTIVE).increment(1.0);
        StreamGauge
    }
}

impl Drop for StreamGauge {
    fn drop(&mut self) {
        metrics::gauge!(REALTIME_STREAMS_ACTIVE).decrement(1.0);
    }
}

fn notice_event(notice: &Notice) -> Event {
    Event::default()
        .event("notice")
        .json_data(notice)
        .unwrap_or_else(|_| resync_event(0))
}

fn resync_event(missed: u64) -> Event {
    Event::default()
        .event("resync")
        .data(format!("{{\"missed\":{missed}}}"))
}

fn topic_stream(rx: Subscription) -> BoxStream<'static, Event> {
    stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(notice) => Some((notice_event(&notice), rx)),
            Err(RecvError::Lagged(missed)) => Some((resync_event(missed), rx)),
            Err(RecvError::Closed) => None,
        }
    })
    .boxed()
}

pub async fn subscribe(
    Identity(caller): Identity,
    studio: Studio,
    QueryParams(query): QueryParams<RealtimeQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, HttpError> {
    let engine = studio.engine;
    let mut topics = Vec::new();
    if let Some(instructor_id) = query.instructor_id {
        topics.push(Topic::Instructor(instructor_id));
    }
    if let Some(booking_id) = query.booking_id {
        // Same visibility as reading the booking.
        engine.get_booking(&caller, &booking_id).await?;
        topics.push(Topic::Booking(booking_id));
    }
    if topics.is_empty() {
        return Err(HttpError::bad_request(
            "instructor_id or booking_id is required",
        ));
    }

    tracing::debug!(user = %caller.id, studio = %studio.name, ?topics, "realtime stream opened");
    let merged = stream::select_all(
        topics
            .into_iter()
            .map(|topic| topic_stream(engine.notify.watch(topic))),
    );
    let gauge = StreamGauge::open();
    let events = stream::once(async { Event::default().event("ready").data("{}") })
        .chain(merged)
        .map(move |event| {
            let _open = &gauge;
            Ok(event)
        });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}
