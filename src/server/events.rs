//! Server-sent event stream over a session's progress log.

use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
};
use futures::{StreamExt, stream};
use serde::Deserialize;
use serde_json::json;

use super::api::{ApiError, SharedState, user_id};
use crate::progress::{EventType, ProgressEvent};

#[derive(Debug, Default, Deserialize)]
pub struct EventsQuery {
    pub from: Option<u64>,
}

/// Resume point: `Last-Event-ID` wins over `?from=`, since browsers send it
/// on automatic reconnect.
fn start_index(headers: &HeaderMap, query: &EventsQuery) -> u64 {
    headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|last| last + 1)
        .or(query.from)
        .unwrap_or(0)
}

fn to_sse(event: &ProgressEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(data) => Some(
            Event::default()
                .id(event.sequence_index.to_string())
                .event(event.event_type.as_str())
                .data(data),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize progress event");
            None
        }
    }
}

pub async fn session_events(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> Result<Response, ApiError> {
    let user = user_id(&headers);
    state
        .service
        .pipeline()
        .store()
        .get_session(&session_id, &user)
        .await
        .map_err(ApiError::Store)?;

    let from = start_index(&headers, &query);
    let subscription = state.hub.subscribe(&session_id, from);
    tracing::debug!(session_id = %session_id, from, "progress stream opened");

    let connected = Event::default()
        .event(EventType::Connected.as_str())
        .data(json!({"session_id": session_id, "from": from}).to_string());
    let events = subscription
        .into_stream()
        .filter_map(|event| async move { to_sse(&event) });
    let body = stream::once(async move { connected })
        .chain(events)
        .map(Ok::<_, Infallible>);

    Ok(Sse::new(body).into_response())
}
