//! The signaling channel: one logical duplex connection to the signaling
//! endpoint, replaced wholesale on every `connect()`.
//!
//! The channel never reconnects by itself. Failures surface as
//! [`ChannelEvent::Error`] and the owner decides when to call `connect()` again.

use std::sync::{Arc, Mutex};

use maple_common::{lock_unpoisoned, Error, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::observer::{Observers, Subscription};
use crate::protocol::{decode_inbound, Inbound, SignalingMessage};
use crate::transport::{LinkEvent, SignalingConnector};
use crate::types::{ChannelState, IceCandidate};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Error(String),
    Offer(String),
    Candidate(IceCandidate),
}

/// A channel event tagged with the connection generation that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelNotice {
    pub generation: u64,
    pub event: ChannelEvent,
}

struct Inner {
    state: ChannelState,
    generation: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    inner: Mutex<Inner>,
    observers: Observers<ChannelNotice>,
}

impl Shared {
    fn is_current(&self, generation: u64) -> bool {
        lock_unpoisoned(&self.inner).generation == generation
    }

    fn emit(&self, generation: u64, event: ChannelEvent) {
        if !self.is_current(generation) {
            debug!("dropping signaling event from superseded connection #{generation}");
            return;
        }
        self.observers.notify(&ChannelNotice { generation, event });
    }

    /// Mark the connection closed if it is still the current one.
    fn close_current(&self, generation: u64) -> bool {
        let mut inner = lock_unpoisoned(&self.inner);
        if inner.generation != generation {
            return false;
        }
        inner.state = ChannelState::Closed;
        inner.outbound = None;
        true
    }
}

pub struct SignalingChannel {
    url: String,
    connector: Arc<dyn SignalingConnector>,
    shared: Arc<Shared>,
}

impl SignalingChannel {
    pub fn new(url: impl Into<String>, connector: Arc<dyn SignalingConnector>) -> Self {
        Self {
            url: url.into(),
            connector,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ChannelState::Closed,
                    generation: 0,
                    outbound: None,
                    task: None,
                }),
                observers: Observers::new(),
            }),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> ChannelState {
        lock_unpoisoned(&self.shared.inner).state
    }

    /// Generation of the current (or most recent) connection.
    pub fn generation(&self) -> u64 {
        lock_unpoisoned(&self.shared.inner).generation
    }

    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ChannelNotice) + Send + Sync + 'static,
    {
        self.shared.observers.subscribe(handler)
    }

    /// Close any existing connection and open a new one.
    ///
    /// Returns the generation of the new connection; events from earlier
    /// generations are never delivered after this returns.
    pub fn connect(&self) -> u64 {
        let mut inner = lock_unpoisoned(&self.shared.inner);
        inner.generation += 1;
        let generation = inner.generation;
        if let Some(task) = inner.task.take() {
            task.abort();
            debug!("closed signaling connection #{}", generation - 1);
        }
        inner.outbound = None;
        inner.state = ChannelState::Connecting;

        info!("signaling: connecting to {} (#{})", self.url, generation);
        inner.task = Some(tokio::spawn(run_connection(
            self.shared.clone(),
            self.connector.clone(),
            self.url.clone(),
            generation,
        )));
        generation
    }

    /// Close the connection without opening a new one.
    pub fn close(&self) {
        let mut inner = lock_unpoisoned(&self.shared.inner);
        inner.generation += 1;
        if let Some(task) = inner.task.take() {
            task.abort();
        }
        inner.outbound = None;
        inner.state = ChannelState::Closed;
    }

    pub fn send_answer(&self, sdp: impl Into<String>) -> Result<()> {
        self.send(&SignalingMessage::Answer { sdp: sdp.into() })
    }

    pub fn send_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.send(&SignalingMessage::Candidate { candidate })
    }

    fn send(&self, msg: &SignalingMessage) -> Result<()> {
        let inner = lock_unpoisoned(&self.shared.inner);
        let outbound = match (&inner.state, &inner.outbound) {
            (ChannelState::Open, Some(outbound)) => outbound,
            _ => return Err(Error::NotConnected),
        };
        outbound
            .send(msg.encode()?)
            .map_err(|_| Error::transport("signaling link closed"))
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_connection(
    shared: Arc<Shared>,
    connector: Arc<dyn SignalingConnector>,
    url: String,
    generation: u64,
) {
    let mut link = match connector.open(&url).await {
        Ok(link) => link,
        Err(e) => {
            if shared.close_current(generation) {
                warn!("signaling: connection #{} failed: {}", generation, e);
                shared.emit(generation, ChannelEvent::Error(e.to_string()));
            }
            return;
        }
    };

    {
        let mut inner = lock_unpoisoned(&shared.inner);
        if inner.generation != generation {
            return;
        }
        inner.state = ChannelState::Open;
        inner.outbound = Some(link.outbound.clone());
    }
    info!("signaling: connection #{} open", generation);
    shared.emit(generation, ChannelEvent::Open);

    let reason = loop {
        match link.inbound.recv().await {
            Some(LinkEvent::Text(text)) => match decode_inbound(&text) {
                Ok(Inbound::Offer(sdp)) => shared.emit(generation, ChannelEvent::Offer(sdp)),
                Ok(Inbound::Candidate(candidate)) => {
                    shared.emit(generation, ChannelEvent::Candidate(candidate))
                }
                Ok(Inbound::Unknown(tag)) => {
                    info!("signaling: ignoring message with tag {:?}", tag);
                }
                Err(e) => warn!("signaling: dropping malformed message: {}", e),
            },
            Some(LinkEvent::Closed(reason)) => {
                break format!(
                    "closed by remote{}",
                    reason.map(|r| format!(": {r}")).unwrap_or_default()
                )
            }
            Some(LinkEvent::Error(e)) => break e,
            None => break "link dropped".to_string(),
        }
    };

    if shared.close_current(generation) {
        warn!("signaling: connection #{} lost: {}", generation, reason);
        shared.emit(generation, ChannelEvent::Error(reason));
    }
}
