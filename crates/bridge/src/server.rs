//! JSON websocket front end wiring `ControlDispatcher` and the telemetry
//! watch channel published by `TelemetryBroadcaster` into one per-connection
//! handler, the way `teleop::ws::WsServer` wires its binary UDP-equivalent
//! protocol — reworked here to JSON `Message::Text` per §6's command surface.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use types::{Command, CommandError};

use crate::broadcaster::TelemetryPush;
use crate::dispatcher::ControlDispatcher;
use crate::DispatchError;

/// Accepts JSON command connections and pushes telemetry to each one.
pub struct BridgeServer {
    port: u16,
    dispatcher: ControlDispatcher,
    telemetry_rx: watch::Receiver<TelemetryPush>,
}

impl BridgeServer {
    pub fn new(port: u16, dispatcher: ControlDispatcher, telemetry_rx: watch::Receiver<TelemetryPush>) -> Self {
        Self { port, dispatcher, telemetry_rx }
    }

    pub async fn run(self) -> Result<(), DispatchError> {
        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(addr, "bridge control/telemetry server listening");

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(err) => {
                    error!(?err, "failed to accept bridge connection");
                    continue;
                }
            };
            let dispatcher = self.dispatcher.clone();
            let telemetry_rx = self.telemetry_rx.clone();
            tokio::spawn(async move {
                info!(%peer, "bridge client connected");
                if let Err(err) = handle_connection(stream, dispatcher, telemetry_rx).await {
                    warn!(%peer, ?err, "bridge connection ended with error");
                }
                info!(%peer, "bridge client disconnected");
            });
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    dispatcher: ControlDispatcher,
    mut telemetry_rx: watch::Receiver<TelemetryPush>,
) -> Result<(), DispatchError> {
    let _ = stream.set_nodelay(true);
    let ws_stream = accept_async(stream).await?;
    let (mut sender, mut receiver) = ws_stream.split();

    // Acks and telemetry pushes both go out over the same socket, so they
    // are funneled through one mpsc channel into a single writer task
    // rather than each side holding its own half of the split sink.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    let telemetry_tx = out_tx.clone();
    let telemetry_task = tokio::spawn(async move {
        loop {
            if telemetry_rx.changed().await.is_err() {
                break;
            }
            let push = telemetry_rx.borrow_and_update().clone();
            let Ok(text) = serde_json::to_string(&push) else { continue };
            if telemetry_tx.send(Message::Text(text.into())).is_err() {
                break;
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let reply = dispatch_text(&dispatcher, &text);
                debug!(reply, "bridge command handled");
                if out_tx.send(Message::Text(reply.into())).is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) => {}
            Err(err) => {
                warn!(?err, "bridge websocket receive error");
                break;
            }
            _ => {}
        }
    }

    telemetry_task.abort();
    drop(out_tx);
    writer_task.abort();
    Ok(())
}

/// Parse `text` as a `Command` and dispatch it, returning the JSON reply
/// that would be sent back to the client. Split out from the I/O loop so
/// parse/dispatch behavior is covered without a real socket.
fn dispatch_text(dispatcher: &ControlDispatcher, text: &str) -> String {
    let command: Result<Command, _> = serde_json::from_str(text);
    let result = match command {
        Ok(command) => dispatcher.handle(command),
        Err(_) => Err(CommandError::new(format!(
            "unsupported action: {}",
            offending_action(text)
        ))),
    };
    match result {
        Ok(ack) => serde_json::to_string(&ack),
        Err(err) => serde_json::to_string(&err),
    }
    .unwrap_or_else(|_| "{\"ok\":false,\"error\":\"reply_serialize_failed\"}".to_string())
}

fn offending_action(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|value| value.get("action").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use robot::RobotDriver;

    fn dispatcher() -> ControlDispatcher {
        ControlDispatcher::new(RobotDriver::new(link::SerialLink::closed_for_test()))
    }

    #[test]
    fn unknown_action_reports_its_name() {
        let reply = dispatch_text(&dispatcher(), r#"{"action":"levitate"}"#);
        assert!(reply.contains("unsupported action: levitate"));
    }

    #[test]
    fn malformed_json_reports_unknown_action() {
        let reply = dispatch_text(&dispatcher(), "not json at all");
        assert!(reply.contains("unsupported action: unknown"));
    }

    #[test]
    fn ping_round_trips_to_an_ack() {
        let reply = dispatch_text(&dispatcher(), r#"{"action":"ping"}"#);
        assert!(reply.contains("\"action\":\"ping\""));
        assert!(reply.contains("\"ok\":true"));
    }
}
