// =============================================================================
// Event-channel transport — WebSocket boundary of the SDK
// =============================================================================
//
// Inbound frames are JSON packets tagged by `type`: synchronization events
// decode straight into `TerminalEvent`, trade responses into `RpcResponse`.
// Whatever the transport, every decoded packet funnels into a single
// unbounded queue so that all state mutation happens on one dispatch task.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{Result, SdkError};
use crate::events::TerminalEvent;
use crate::types::TradeResponse;

/// A correlated RPC response frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub request_id: String,
    #[serde(flatten)]
    pub response: TradeResponse,
}

/// One decoded inbound frame.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    Event(TerminalEvent),
    Response(RpcResponse),
}

/// Decode a raw text frame into an inbound message.
pub fn decode_packet(text: &str) -> Result<InboundMessage> {
    let value: Value = serde_json::from_str(text)
        .map_err(|err| SdkError::Transport(format!("malformed packet: {err}")))?;
    match value.get("type").and_then(Value::as_str) {
        Some("response") => Ok(InboundMessage::Response(
            serde_json::from_value(value)
                .map_err(|err| SdkError::Transport(format!("malformed response: {err}")))?,
        )),
        Some(_) => Ok(InboundMessage::Event(
            serde_json::from_value(value)
                .map_err(|err| SdkError::Transport(format!("malformed event: {err}")))?,
        )),
        None => Err(SdkError::Transport("packet without a type tag".into())),
    }
}

/// Outbound side of the event channel.
#[async_trait]
pub trait TerminalTransport: Send + Sync {
    /// Send one JSON payload to the remote service.
    async fn send(&self, payload: Value) -> Result<()>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// WebSocket transport over `tokio-tungstenite`.
pub struct WsTransport {
    writer: tokio::sync::Mutex<WsSink>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    /// Connect to the event channel and start the read loop.
    ///
    /// Returns the transport plus the inbound queue carrying every decoded
    /// frame; hand the queue to the connection orchestrator.
    pub async fn connect(
        url: &str,
        token: &str,
    ) -> Result<(Arc<Self>, UnboundedReceiver<InboundMessage>)> {
        let request = format!("{url}?auth-token={token}");
        info!(url = %url, "connecting to event channel");
        let (ws_stream, _response) = connect_async(&request).await?;
        info!(url = %url, "event channel connected");

        let (writer, reader) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_read_loop(reader, tx));

        Ok((
            Arc::new(Self {
                writer: tokio::sync::Mutex::new(writer),
                reader: Mutex::new(Some(handle)),
            }),
            rx,
        ))
    }

    /// Stop the read loop and drop the socket.
    pub async fn close(&self) {
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
        let _ = self.writer.lock().await.close().await;
    }
}

#[async_trait]
impl TerminalTransport for WsTransport {
    async fn send(&self, payload: Value) -> Result<()> {
        let text = payload.to_string();
        debug!(bytes = text.len(), "sending frame");
        self.writer
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(SdkError::from)
    }
}

async fn run_read_loop(
    mut reader: impl Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
    tx: UnboundedSender<InboundMessage>,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => match decode_packet(&text) {
                Ok(message) => {
                    if tx.send(message).is_err() {
                        debug!("inbound queue dropped, stopping read loop");
                        return;
                    }
                }
                Err(err) => warn!(error = %err, "failed to decode inbound frame"),
            },
            Ok(Message::Close(_)) => {
                warn!("event channel closed by server");
                return;
            }
            Ok(_) => {}
            Err(err) => {
                warn!(error = %err, "event channel read error");
                return;
            }
        }
    }
    warn!("event channel stream ended");
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// In-memory transport: records outbound payloads and answers trade
    /// requests through the inbound queue, like the real server would.
    pub(crate) struct EchoTransport {
        pub sent: Mutex<Vec<Value>>,
        reply: UnboundedSender<InboundMessage>,
        trade_reply: Mutex<(i64, String, String)>,
    }

    impl EchoTransport {
        pub fn new(reply: UnboundedSender<InboundMessage>) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                reply,
                trade_reply: Mutex::new((
                    10009,
                    "TRADE_RETCODE_DONE".to_string(),
                    "done".to_string(),
                )),
            }
        }

        /// Make subsequent trade requests fail with the given retcode.
        pub fn fail_with(&self, numeric_code: i64, string_code: &str, message: &str) {
            *self.trade_reply.lock() =
                (numeric_code, string_code.to_string(), message.to_string());
        }
    }

    #[async_trait]
    impl TerminalTransport for EchoTransport {
        async fn send(&self, payload: Value) -> Result<()> {
            self.sent.lock().push(payload.clone());
            if payload.get("type").and_then(Value::as_str) == Some("trade") {
                let (numeric_code, string_code, message) = self.trade_reply.lock().clone();
                let frame = serde_json::json!({
                    "type": "response",
                    "requestId": payload["requestId"],
                    "numericCode": numeric_code,
                    "stringCode": string_code,
                    "message": message,
                    "orderId": "46870472",
                });
                let _ = self.reply.send(decode_packet(&frame.to_string())?);
            }
            Ok(())
        }
    }
}
