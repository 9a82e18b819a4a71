//! Server-sent event streams over the fan-out hubs.
//!
//! Each connection is one hub subscription. The event name is the topic and
//! the data is the JSON payload. Dropping the connection drops the
//! subscription, which unregisters it from the hub.

use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use tracing::debug;

use super::{error::ApiError, models::StreamQuery, state::AppState, utils};
use crate::progress::{FanoutHub, HubEvent};

const KEEP_ALIVE: Duration = Duration::from_secs(15);

/// GET /parts/stream
pub async fn parts_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    subscribe(state.pipeline.parts_hub(), &query)
}

/// GET /bundles/stream
pub async fn bundles_stream(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    subscribe(state.pipeline.bundles_hub(), &query)
}

fn subscribe(
    hub: &FanoutHub,
    query: &StreamQuery,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>> + use<>>, ApiError> {
    let topics = utils::parse_topics(query.topics.as_deref())?;
    let subscription = hub.subscribe(&topics);
    debug!(
        subscriber = subscription.id(),
        topics = ?topics,
        "Stream subscriber connected"
    );

    let events = subscription.map(|event| to_sse(&event));
    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE)))
}

fn to_sse(event: &HubEvent) -> Result<Event, axum::Error> {
    Event::default()
        .event(event.topic.as_str())
        .json_data(&event.data)
}
