//! `GET /sessions/{id}/events` as server-sent events.
//!
//! The stream opens with a `snapshot` event carrying the current session
//! state, then forwards that session's lifecycle events. Subscribers that fall
//! behind skip the missed events; polling the snapshot stays authoritative.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use dojo_core::events::SessionEvent;
use dojo_core::ids::SessionId;
use futures::stream::{self, Stream, StreamExt};
use metrics::{counter, gauge};
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::api_errors::ApiError;
use crate::metrics::{EVENT_STREAMS_ACTIVE, HTTP_REQUESTS_TOTAL};
use crate::server::AppState;

const KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Decrements the open-stream gauge when the client goes away.
struct StreamGuard;

impl StreamGuard {
    fn open() -> Self {
        gauge!(EVENT_STREAMS_ACTIVE).increment(1.0);
        Self
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        gauge!(EVENT_STREAMS_ACTIVE).decrement(1.0);
    }
}

fn to_sse(event: &SessionEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_default();
    Event::default().event(event.event_type()).data(data)
}

/// GET /sessions/{id}/events
pub async fn session_events(
    State(state): State<AppState>,
    Path(id): Path<SessionId>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    counter!(HTTP_REQUESTS_TOTAL, "route" => "session_events").increment(1);
    // Subscribe before snapshotting so nothing falls in the gap.
    let receiver = state.manager.subscribe();
    let snapshot = state.manager.get_status(&id).await?;
    debug!(session_id = %id, "event stream opened");

    let first = Event::default()
        .event("snapshot")
        .data(serde_json::to_string(&snapshot).unwrap_or_default());
    let guard = StreamGuard::open();
    let updates = BroadcastStream::new(receiver).filter_map(move |item| {
        let _held = &guard;
        let event = match item {
            Ok(event) if event.session_id == id => Some(Ok::<_, Infallible>(to_sse(&event))),
            _ => None,
        };
        std::future::ready(event)
    });

    let stream = stream::once(std::future::ready(Ok::<_, Infallible>(first))).chain(updates);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE)))
}
