//! UpstreamClient - connect, subscribe, listen, reconnect
//!
//! One client per configured source. The run loop never gives up: a failed
//! connect waits the fixed retry interval and tries again, a lost session goes
//! straight back to connecting and resends the same subscribe request.

use super::transport::{Connector, Transport};
use crate::config::UpstreamConfig;
use crate::error::{RelayError, Result};
use crate::protocol::{classify_upstream, Request, UpstreamFrame};
use crate::state::StateHubHandle;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const SUBSCRIBE_REQUEST_ID: u64 = 1;
const QUERY_REQUEST_ID: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
}

/// Called with the upstream name on every state transition
pub type StatusCallback = Arc<dyn Fn(&str, ConnectionState) + Send + Sync>;

/// How a connected session ended
enum SessionEnd {
    Cancelled,
    /// Subscribe or seed query could not be sent
    SubscribeFailed(RelayError),
    /// Stream closed or failed after subscribing
    Lost { reason: String, frames: u64 },
}

#[derive(Clone)]
pub struct UpstreamClient {
    config: Arc<UpstreamConfig>,
    hub: StateHubHandle,
    connector: Arc<dyn Connector>,
    cancel: CancellationToken,
    /// Built once so every reconnect sends an identical request
    subscribe_request: Arc<Request>,
    query_request: Option<Arc<Request>>,
    state: Arc<RwLock<ConnectionState>>,
    status_callbacks: Arc<RwLock<Vec<StatusCallback>>>,
    reconnect_count: Arc<AtomicU64>,
}

impl UpstreamClient {
    pub fn new(
        config: UpstreamConfig,
        hub: StateHubHandle,
        connector: Arc<dyn Connector>,
        cancel: CancellationToken,
    ) -> Self {
        let subscribe_request = Request::subscribe(
            &config.method_namespace,
            &config.objects,
            SUBSCRIBE_REQUEST_ID,
        );
        let query_request = config.seed_query.then(|| {
            Arc::new(Request::query(
                &config.method_namespace,
                &config.objects,
                QUERY_REQUEST_ID,
            ))
        });

        Self {
            config: Arc::new(config),
            hub,
            connector,
            cancel,
            subscribe_request: Arc::new(subscribe_request),
            query_request,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            status_callbacks: Arc::new(RwLock::new(Vec::new())),
            reconnect_count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Connect attempts made after the first one
    pub fn reconnect_count(&self) -> u64 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    pub fn on_status(&self, callback: StatusCallback) {
        self.status_callbacks.write().push(callback);
    }

    fn emit_status(&self, state: ConnectionState) {
        *self.state.write() = state;
        for callback in self.status_callbacks.read().iter() {
            callback(&self.config.name, state);
        }
    }

    /// Run the connect/listen cycle on a new task
    pub fn spawn(&self) -> JoinHandle<()> {
        let client = self.clone();
        tokio::spawn(async move { client.run().await })
    }

    /// Connect/subscribe/listen until cancelled
    pub async fn run(&self) {
        info!(
            "🔌 Upstream '{}' starting ({})",
            self.config.name, self.config.uri
        );
        let mut first_attempt = true;

        while !self.cancel.is_cancelled() {
            if !first_attempt {
                self.reconnect_count.fetch_add(1, Ordering::Relaxed);
            }
            first_attempt = false;

            self.emit_status(ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.connector.connect(&self.config.uri) => result,
            };

            let mut transport = match connected {
                Ok(transport) => transport,
                Err(e) => {
                    warn!(
                        "Upstream '{}' connect failed: {} (retrying in {:?})",
                        self.config.name,
                        e,
                        self.config.retry_interval()
                    );
                    self.emit_status(ConnectionState::Disconnected);
                    if !self.wait_retry().await {
                        break;
                    }
                    continue;
                }
            };

            match self.session(transport.as_mut()).await {
                SessionEnd::Cancelled => break,
                SessionEnd::SubscribeFailed(e) => {
                    warn!("Upstream '{}' subscribe failed: {}", self.config.name, e);
                    self.emit_status(ConnectionState::Disconnected);
                    if !self.wait_retry().await {
                        break;
                    }
                }
                SessionEnd::Lost { reason, frames } => {
                    info!(
                        "Upstream '{}' connection lost after {} frames: {}",
                        self.config.name, frames, reason
                    );
                    self.emit_status(ConnectionState::Disconnected);
                    // A peer that drops us before sending anything would
                    // otherwise be reconnected in a tight loop
                    if frames == 0 && !self.wait_retry().await {
                        break;
                    }
                }
            }
        }

        self.emit_status(ConnectionState::Disconnected);
        info!("Upstream '{}' stopped", self.config.name);
    }

    async fn session(&self, transport: &mut dyn Transport) -> SessionEnd {
        if let Err(e) = self.send_subscription(transport).await {
            return SessionEnd::SubscribeFailed(e);
        }
        self.emit_status(ConnectionState::Subscribed);
        info!("✅ Upstream '{}' subscribed", self.config.name);

        let mut frames = 0;
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return SessionEnd::Cancelled,
                next = transport.next_text() => next,
            };

            match next {
                None => {
                    return SessionEnd::Lost {
                        reason: "closed by peer".to_string(),
                        frames,
                    }
                }
                Some(Err(RelayError::ProtocolDecode(e))) => {
                    warn!("Upstream '{}' sent an undecodable frame: {}", self.config.name, e);
                }
                Some(Err(e)) => {
                    return SessionEnd::Lost {
                        reason: e.to_string(),
                        frames,
                    }
                }
                Some(Ok(text)) => {
                    frames += 1;
                    self.handle_frame(&text);
                }
            }
        }
    }

    async fn send_subscription(&self, transport: &mut dyn Transport) -> Result<()> {
        transport.send_text(self.subscribe_request.to_text()?).await?;
        if let Some(query) = &self.query_request {
            transport.send_text(query.to_text()?).await?;
        }
        debug!("Upstream '{}' subscribe request sent", self.config.name);
        Ok(())
    }

    fn handle_frame(&self, text: &str) {
        match classify_upstream(text) {
            Ok(UpstreamFrame::StatusUpdate(values)) | Ok(UpstreamFrame::QueryResult(values)) => {
                trace!("Upstream '{}' update with {} keys", self.config.name, values.len());
                self.hub.merge(self.config.name.clone(), values);
            }
            Ok(UpstreamFrame::Other) => {
                trace!("Upstream '{}' ignored frame: {}", self.config.name, text);
            }
            Err(e) => {
                warn!("Upstream '{}' dropped frame: {}", self.config.name, e);
            }
        }
    }

    /// Sleep the retry interval; false if cancelled meanwhile
    async fn wait_retry(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(self.config.retry_interval()) => true,
        }
    }
}
