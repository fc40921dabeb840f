use crate::{
    camera::open_source,
    connection::WsTransport,
    orchestrator::ClientEvent,
    server::SharedState,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures::StreamExt;
use tracing::instrument;

#[instrument(skip(state, ws))]
pub async fn classify_stream(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_stream(state, session_id, socket))
}

async fn run_stream(state: SharedState, session_id: String, socket: WebSocket) {
    let (sink, stream) = socket.split();
    let inbound = stream.map(|message| match message {
        Ok(Message::Close(_)) | Err(_) => ClientEvent::Closed,
        Ok(_) => ClientEvent::Activity,
    });

    let camera = state.camera_config.clone();
    let exit = state
        .orchestrator
        .run(
            &session_id,
            WsTransport::new(sink),
            inbound,
            move || open_source(&camera),
            state.control.subscribe(),
        )
        .await;

    tracing::info!("Stream for session {} ended: {:?}", session_id, exit);
}
