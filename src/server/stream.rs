use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt, stream};
use serde::Deserialize;
use tracing::{debug, warn};

use super::api::{ApiError, SharedState};
use crate::consumer::transport::{CLOSE_EVENT_NAME, PROGRESS_EVENT_NAME};
use crate::events::StreamMessage;

/// How often an idle stream sends a keep-alive comment.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

const LAST_EVENT_ID: &str = "last-event-id";

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    /// Resume after this sequence. Falls back to the `Last-Event-ID` header.
    pub after: Option<u64>,
}

/// Live progress for one project. The subscription is released when the
/// client goes away or after the `close` frame has been sent.
///
/// Each progress frame's SSE id is the event sequence, so a reconnecting
/// client can resume with `?after=` or `Last-Event-ID`.
pub async fn stream_handler(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let after = query.after.or_else(|| {
        headers
            .get(LAST_EVENT_ID)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
    });

    let subscription = match after {
        Some(after) => state
            .distributor
            .resume(&state.store, &id, after)
            .await
            .map_err(|e| ApiError::Internal(format!("Failed to resume stream: {:#}", e)))?,
        None => state.distributor.subscribe_stream(&id).boxed(),
    };
    debug!(project_id = %id, after_sequence = ?after, "stream opened");

    let events = stream::unfold(Some(subscription), |pending| async move {
        let mut subscription = pending?;
        loop {
            let message = subscription.next().await?;
            let closed = matches!(message, StreamMessage::Closed);
            if let Some(event) = to_sse_event(message) {
                let next = if closed { None } else { Some(subscription) };
                return Some((Ok::<_, Infallible>(event), next));
            }
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

fn to_sse_event(message: StreamMessage) -> Option<Event> {
    match message {
        StreamMessage::Event(envelope) => {
            let event = Event::default()
                .event(PROGRESS_EVENT_NAME)
                .id(envelope.sequence.to_string());
            match event.json_data(&envelope) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!(project_id = %envelope.project_id, error = %e, "dropping unserializable event");
                    None
                }
            }
        }
        StreamMessage::Closed => Some(Event::default().event(CLOSE_EVENT_NAME).data("{}")),
    }
}
