//! Server-Sent-Events adapter for a session's [`Subscriber`].
//!
//! The HTTP layer hands the returned [`Sse`] straight back as a response.
//! When the client disconnects, axum drops the stream and the subscriber
//! deregisters itself.

use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;

use crate::channel::Subscriber;
use crate::events::ExecEvent;

/// Encode one event as an SSE frame named after the event.
pub fn to_sse_event(event: &ExecEvent) -> Result<Event, axum::Error> {
    Event::default().event(event.name()).json_data(event.payload())
}

/// Stream a subscriber's events as SSE until its stream ends.
pub fn event_stream(
    subscriber: Subscriber,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let stream = futures::stream::unfold(subscriber, |mut subscriber| async move {
        let event = subscriber.recv().await?;
        match to_sse_event(&event) {
            Ok(frame) => Some((Ok(frame), subscriber)),
            Err(e) => {
                subscriber.fail(e);
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
