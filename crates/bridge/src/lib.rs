//! Client-facing control dispatch and telemetry broadcast (§4.7–§4.8).
//!
//! `ControlDispatcher` and `TelemetryBroadcaster` are transport-agnostic;
//! `BridgeServer` wires both onto a single JSON websocket endpoint per
//! connection, the way `teleop::ws::WsServer` combines a command receive
//! loop and a telemetry send loop on one socket.

mod broadcaster;
mod dispatcher;
mod server;

pub use broadcaster::{BroadcasterConfig, Odometry, TelemetryBroadcaster, TelemetryPush};
pub use dispatcher::ControlDispatcher;
pub use server::BridgeServer;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("bridge server io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("bridge websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
