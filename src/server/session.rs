//! One downstream JSON-RPC connection
//!
//! Transport agnostic: the WebSocket handler feeds inbound text in and drains
//! the outbound frame queue. Every reply and notification for the connection
//! goes through the same queue, so per-connection order is preserved.

use crate::error::Result;
use crate::protocol::{MethodKind, OutboundFrame, Request, Response};
use crate::state::{ConnectionId, FrameSink, StateHubHandle};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub struct Session {
    connection_id: ConnectionId,
    hub: StateHubHandle,
    tx: FrameSink,
}

impl Session {
    /// Allocate an id and attach the outbound queue to the hub
    pub fn open(hub: StateHubHandle) -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = hub.next_connection_id();
        hub.attach(connection_id, tx.clone());
        debug!(connection_id, "Session opened");

        (
            Self {
                connection_id,
                hub,
                tx,
            },
            rx,
        )
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// Dispatch one inbound frame.
    ///
    /// Malformed frames are answered with a parse error and the session stays
    /// open. Only a stopped hub is returned as an error.
    pub async fn handle_text(&self, text: &str) -> Result<()> {
        let request: Request = match serde_json::from_str(text) {
            Ok(request) => request,
            Err(e) => {
                warn!(connection_id = self.connection_id, "Undecodable frame: {}", e);
                self.reply(Response::parse_error(e.to_string()));
                return Ok(());
            }
        };

        debug!(
            connection_id = self.connection_id,
            method = %request.method,
            "Request received"
        );

        match request.kind() {
            MethodKind::Subscribe => {
                // Ack and the initial notification are queued by the hub
                self.hub
                    .subscribe_with_ack(self.connection_id, request.id.clone(), request.objects())
                    .await?;
            }
            MethodKind::Query => {
                let values = self.hub.query(request.objects()).await?;
                self.reply(Response::status(request.id, values));
            }
            MethodKind::Unsubscribe => {
                self.hub.unsubscribe(self.connection_id);
                self.reply(Response::ok(request.id, json!({})));
            }
            // No id: a JSON-RPC notification, which never gets a reply
            MethodKind::Other if request.id.is_null() => {
                debug!(
                    connection_id = self.connection_id,
                    method = %request.method,
                    "Ignoring unknown notification"
                );
            }
            MethodKind::Other => {
                self.reply(Response::method_not_found(request.id, &request.method));
            }
        }
        Ok(())
    }

    fn reply(&self, response: Response) {
        let _ = self.tx.send(response.into());
    }

    /// Detach from the hub, dropping every subscription of this connection
    pub fn close(self) {
        self.hub.detach(self.connection_id);
        debug!(connection_id = self.connection_id, "Session closed");
    }
}
