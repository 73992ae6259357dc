//! Server-Sent Events transport for [`PushRegistry`] sinks.

use std::convert::Infallible;
use std::sync::Arc;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{self, Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use super::registry::{PushEvent, PushRegistry, SinkId};

/// Unregisters the sink when the response stream is dropped.
struct SinkGuard {
    registry: Arc<PushRegistry>,
    user_id: String,
    sink_id: SinkId,
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        self.registry.remove_client(&self.user_id, self.sink_id);
        info!(user_id = %self.user_id, sink_id = %self.sink_id, "Event stream closed");
    }
}

fn to_sse(event: PushEvent) -> Event {
    Event::default().event(event.event).data(event.data.to_string())
}

/// Register a sink for `user_id` and stream its events.
///
/// The first event is `connected`, sent once the sink is registered.
pub fn event_stream(
    registry: Arc<PushRegistry>,
    user_id: String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (sink_id, rx) = registry.subscribe(&user_id);
    info!(user_id = %user_id, sink_id = %sink_id, "Event stream opened");

    let hello = PushEvent::new(
        "connected",
        serde_json::json!({ "userId": user_id, "sinkId": sink_id }),
    );
    let guard = SinkGuard {
        registry,
        user_id,
        sink_id,
    };

    let events = stream::once(async move { hello })
        .chain(ReceiverStream::new(rx))
        .map(move |event| {
            let _guard = &guard;
            Ok(to_sse(event))
        });

    Sse::new(events).keep_alive(KeepAlive::default())
}
