//! `GET /ws`: the live push channel.
//!
//! A client gets a `connected` acknowledgement and then every reading
//! accepted after that point. History is not replayed; clients that need it
//! fetch `GET /live` after connecting.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error};

use super::AppState;
use crate::hub::{HubMessage, Subscription};

// ---

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(upgrade))
}

async fn upgrade(ws: WebSocketUpgrade, State(session): State<AppState>) -> Response {
    // ---
    ws.on_upgrade(move |socket| {
        let subscription = session.hub().register();
        serve(socket, subscription)
    })
}

async fn serve(socket: WebSocket, mut subscription: Subscription) {
    // ---
    let id = subscription.id();
    let (mut sink, mut inbound) = socket.split();

    let hello = match HubMessage::connected().to_json() {
        Ok(json) => json,
        Err(e) => {
            error!("Failed to serialize connect message: {}", e);
            return;
        }
    };
    if sink.send(Message::Text(hello.into())).await.is_err() {
        return;
    }
    debug!("Live feed active for subscriber {}", id);

    loop {
        tokio::select! {
            outbound = subscription.recv() => {
                let Some(payload) = outbound else { break };
                if sink.send(Message::Text(payload.as_ref().into())).await.is_err() {
                    break;
                }
            }
            incoming = inbound.next() => match incoming {
                Some(Ok(Message::Text(text))) => match HubMessage::parse(text.as_str()) {
                    Ok(message) => debug!("Ignoring client message from {}: {:?}", id, message),
                    Err(e) => debug!("Discarding malformed message from {}: {}", id, e),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!("Subscriber {} disconnected", id);
    // dropping `subscription` removes it from the hub
}
