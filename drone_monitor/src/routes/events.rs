use crate::server::SharedState;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::Stream;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

pub async fn event_stream(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream = BroadcastStream::new(state.events.subscribe())
        .filter_map(|event| match event {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!("Event subscriber lagging: {}", e);
                None
            }
        })
        .map(|event| Event::default().event(event.name()).json_data(&event));

    Sse::new(stream).keep_alive(KeepAlive::default())
}
