//! Duplex text links to the signaling endpoint.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use maple_common::{env_bool, Error, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, warn};
use url::Url;

/// Something that happened on an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Text(String),
    /// The remote end closed the link.
    Closed(Option<String>),
    /// The link failed.
    Error(String),
}

/// One open duplex connection.
///
/// Dropping the link closes it: the outbound sender goes away (the writer
/// sends a close frame) and the reader task is aborted.
pub struct SignalingLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
    reader: Option<JoinHandle<()>>,
}

impl SignalingLink {
    pub fn new(
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            reader: None,
        }
    }

    fn with_reader(mut self, reader: JoinHandle<()>) -> Self {
        self.reader = Some(reader);
        self
    }
}

impl Drop for SignalingLink {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Opens duplex text links.
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Reject URLs this connector can never open, before any attempt is made.
    fn validate_url(&self, _url: &str) -> Result<()> {
        Ok(())
    }

    async fn open(&self, url: &str) -> Result<SignalingLink>;
}

/// WebSocket signaling over `tokio-tungstenite`.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl SignalingConnector for WsConnector {
    fn validate_url(&self, url: &str) -> Result<()> {
        validate_signaling_url(url)
    }

    async fn open(&self, url: &str) -> Result<SignalingLink> {
        validate_signaling_url(url)?;
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| Error::transport(format!("websocket connect to {url} failed: {e}")))?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                    warn!("Failed to send signaling message: {}", e);
                    return;
                }
            }
            let _ = write.close().await;
            debug!("signaling writer closed");
        });

        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let event = match msg {
                    Ok(WsMessage::Text(text)) => LinkEvent::Text(text.as_str().to_owned()),
                    Ok(WsMessage::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.as_str().to_owned());
                        let _ = in_tx.send(LinkEvent::Closed(reason));
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = in_tx.send(LinkEvent::Error(e.to_string()));
                        return;
                    }
                };
                if in_tx.send(event).is_err() {
                    return;
                }
            }
            let _ = in_tx.send(LinkEvent::Closed(None));
        });

        Ok(SignalingLink::new(out_tx, in_rx).with_reader(reader))
    }
}

/// Check that `url` is a WebSocket URL we are willing to use.
///
/// Plain `ws://` is refused when `MAPLE_ENVIRONMENT_PRODUCTION` is set, unless
/// `MAPLE_ALLOW_INSECURE_SIGNALING` is set as well.
pub fn validate_signaling_url(url: &str) -> Result<()> {
    check_signaling_url(
        url,
        env_bool("MAPLE_ENVIRONMENT_PRODUCTION", false),
        env_bool("MAPLE_ALLOW_INSECURE_SIGNALING", false),
    )
}

fn check_signaling_url(url: &str, production: bool, allow_insecure: bool) -> Result<()> {
    let parsed = Url::parse(url).map_err(|e| Error::config(format!("invalid signaling URL {url}: {e}")))?;
    match parsed.scheme() {
        "wss" => Ok(()),
        "ws" if production && !allow_insecure => Err(Error::config(
            "refusing insecure ws:// signaling URL in production; use wss:// or set MAPLE_ALLOW_INSECURE_SIGNALING=1",
        )),
        "ws" => Ok(()),
        other => Err(Error::config(format!(
            "signaling URL must use ws:// or wss://, got {other}://"
        ))),
    }
}
