pub mod event;
pub mod parse;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connections::{ConntrackConnectionStore, DenyConnectionStore};
use crate::health::HealthMetrics;

use self::event::{EventKind, FlowEvent};

/// Largest datagram accepted from the datapath.
const MAX_DATAGRAM_SIZE: usize = 2048;

/// EventSource delivers datapath flow events into the connection stores.
pub trait EventSource: Send {
    /// Start receiving events until `ctx` is cancelled.
    fn start(
        &mut self,
        ctx: CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Stop receiving and wait for the receive loop to exit.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Routes decoded events to the store owning their kind.
pub struct EventDispatcher {
    conntrack: Arc<ConntrackConnectionStore>,
    deny: Arc<DenyConnectionStore>,
    health: Arc<HealthMetrics>,
}

impl EventDispatcher {
    pub fn new(
        conntrack: Arc<ConntrackConnectionStore>,
        deny: Arc<DenyConnectionStore>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            conntrack,
            deny,
            health,
        }
    }

    /// Decodes and applies one datagram. Malformed datagrams are counted and
    /// dropped.
    pub fn handle_datagram(&self, data: &[u8]) -> Result<(), parse::ParseError> {
        match parse::parse_event(data) {
            Ok(event) => {
                self.dispatch(&event);
                Ok(())
            }
            Err(e) => {
                self.health
                    .events_rejected
                    .with_label_values(&[e.error_type()])
                    .inc();
                Err(e)
            }
        }
    }

    /// Applies a decoded event to its store.
    pub fn dispatch(&self, event: &FlowEvent) {
        self.health
            .events_received
            .with_label_values(&[event.kind.as_str()])
            .inc();

        let observed = event.to_connection();
        match event.kind {
            EventKind::ConntrackUpdate => {
                self.conntrack
                    .add_or_update_conn(&observed, event.timestamp, event.delta());
            }
            EventKind::ConntrackEnd => {
                self.conntrack
                    .add_or_update_conn(&observed, event.timestamp, event.delta());
                self.conntrack.end_conn(&observed.key(), event.timestamp);
            }
            EventKind::Deny => {
                self.deny
                    .add_or_update_conn(&observed, event.timestamp, event.bytes);
            }
        }
    }
}

/// Receives datapath events as UDP datagrams.
pub struct UdpEventSource {
    addr: String,
    dispatcher: Arc<EventDispatcher>,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl UdpEventSource {
    pub fn new(addr: &str, dispatcher: Arc<EventDispatcher>) -> Self {
        Self {
            addr: addr.to_string(),
            dispatcher,
            local_addr: None,
            task: None,
        }
    }

    /// Address the socket is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl EventSource for UdpEventSource {
    async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        let socket = UdpSocket::bind(&self.addr)
            .await
            .with_context(|| format!("binding event socket on {}", self.addr))?;
        let local_addr = socket.local_addr().context("getting event socket address")?;

        info!(addr = %local_addr, "datapath event source listening");
        self.local_addr = Some(local_addr);

        let dispatcher = Arc::clone(&self.dispatcher);
        self.task = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    received = socket.recv_from(&mut buf) => {
                        let (len, peer) = match received {
                            Ok(r) => r,
                            Err(e) => {
                                warn!(error = %e, "receiving datapath event");
                                continue;
                            }
                        };

                        if let Err(e) = dispatcher.handle_datagram(&buf[..len]) {
                            debug!(error = %e, peer = %peer, len, "dropping malformed datapath event");
                        }
                    }
                }
            }
        }));

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(task) = self.task.take() {
            task.await.context("joining event source task")?;
        }
        Ok(())
    }
}
