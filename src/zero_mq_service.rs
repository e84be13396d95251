use std::sync::Arc;

use log::{error, info, warn};
use tokio::{
    sync::{broadcast, Mutex},
    time::{sleep, Duration},
};
use zeromq::{PubSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

use crate::{
    error::{MonitorError, MonitorResult},
    events::MonitorEvent,
    monitor::{ControlCommand, Monitor},
};

fn transport(err: zeromq::ZmqError) -> MonitorError {
    MonitorError::Transport(err.to_string())
}

/// Publishes every monitor event as JSON on a PUB socket.
pub struct Publisher {
    socket: Mutex<PubSocket>,
}

impl Publisher {
    pub async fn bind(endpoint: &str) -> MonitorResult<Arc<Self>> {
        let mut socket = PubSocket::new();
        socket.bind(endpoint).await.map_err(transport)?;
        info!("Publishing monitor events on {}", endpoint);
        Ok(Arc::new(Self {
            socket: Mutex::new(socket),
        }))
    }

    pub async fn publish(&self, event: &MonitorEvent) -> MonitorResult<()> {
        let json = serde_json::to_string(event)?;
        self.socket
            .lock()
            .await
            .send(json.into())
            .await
            .map_err(transport)
    }

    /// Forwards the event bus until it closes.
    pub async fn forward(self: Arc<Self>, mut events: broadcast::Receiver<MonitorEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Err(e) = self.publish(&event).await {
                        error!("Failed to publish {:?}: {}", event, e);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event publisher lagged, {} events skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        info!("Event publisher stopped");
    }
}

/// Decodes a control message. Accepts the JSON object itself or the same
/// object sent as an escaped JSON string.
pub fn decode_command(message: ZmqMessage) -> MonitorResult<ControlCommand> {
    let bytes: Vec<u8> = message
        .into_vec()
        .into_iter()
        .flat_map(|b| b.to_vec())
        .collect();

    match serde_json::from_slice::<ControlCommand>(&bytes) {
        Ok(command) => Ok(command),
        Err(err) => match serde_json::from_slice::<String>(&bytes) {
            Ok(inner) => Ok(serde_json::from_str(&inner)?),
            Err(_) => Err(err.into()),
        },
    }
}

/// Applies control commands received on a SUB socket.
pub struct ControlListener {
    socket: SubSocket,
}

impl ControlListener {
    pub async fn connect(endpoint: &str) -> MonitorResult<Self> {
        let mut socket = SubSocket::new();
        socket.connect(endpoint).await.map_err(transport)?;
        socket.subscribe("").await.map_err(transport)?;
        info!("Listening for control commands on {}", endpoint);
        Ok(Self { socket })
    }

    pub async fn serve(mut self, monitor: Arc<Monitor>) {
        loop {
            match self.socket.recv().await {
                Ok(message) => match decode_command(message) {
                    Ok(command) => {
                        if let Err(e) = monitor.apply(command).await {
                            error!("Control command failed: {}", e);
                        }
                    }
                    Err(e) => warn!("Skipping malformed control message: {}", e),
                },
                Err(e) => {
                    error!("Error receiving control message: {}", e);
                    sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}
