use super::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use livedraw_core::Outbound;

pub async fn handle_websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_observer(socket, state))
}

async fn serve_observer(socket: WebSocket, state: AppState) {
    let mut observer = match state.engine.connect() {
        Ok(observer) => observer,
        Err(e) => {
            tracing::warn!("Refusing WebSocket connection: {}", e);
            return;
        }
    };
    let id = observer.id();
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            outbound = observer.recv() => {
                let message = match outbound {
                    Some(Outbound::Event(text)) => Message::Text(text.to_string().into()),
                    Some(Outbound::Ping) => Message::Ping(Vec::new().into()),
                    None => {
                        tracing::debug!("Observer {} evicted by hub", id);
                        break;
                    }
                };

                if let Err(e) = sender.send(message).await {
                    tracing::debug!("Send to observer {} failed: {}", id, e);
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Pong(_))) => observer.acknowledge(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error from observer {}: {}", id, e);
                        break;
                    }
                }
            }
        }
    }

    state.engine.disconnect(id);
    let _ = sender.close().await;
    tracing::info!("Observer {} disconnected", id);
}
