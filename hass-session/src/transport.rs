//! WebSocket transport layer
//!
//! Connects to the hub, runs the auth handshake, and hands the split socket
//! halves to the session. Knows the handshake frames but nothing about
//! request correlation or events.

use std::time::Duration;

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use hass_protocol::{decode_message, encode_auth, InboundFrame};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::debug;
use url::Url;

use crate::error::{Result, SessionError};

/// Type alias for the WebSocket send half
pub type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Type alias for the WebSocket receive half
pub type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A connected WebSocket transport.
///
/// Only constructed via `Transport::connect()`.
pub struct Transport {
    sink: WsSink,
    stream: WsStream,
}

impl Transport {
    /// Connect to the hub's WebSocket endpoint.
    pub async fn connect(url: &Url) -> Result<Self> {
        debug!(url = %url, "Connecting to hub");

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SessionError::Transport(format!("WebSocket connect failed: {}", e)))?;

        let (sink, stream) = ws.split();

        debug!(url = %url, "WebSocket connected");
        Ok(Self { sink, stream })
    }

    /// Send a text message.
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| SessionError::Transport(format!("Failed to send: {}", e)))
    }

    /// Receive the next text message.
    ///
    /// Returns None if the connection is closed. Control frames are skipped.
    pub async fn recv_text(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Close(_))) => return Ok(None),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(SessionError::Transport(format!("WebSocket error: {}", e)))
                }
                None => return Ok(None),
            }
        }
    }

    /// Run the auth handshake.
    ///
    /// Waits for `auth_required`, answers with the token, and waits for the
    /// verdict. Returns the hub version on success. `auth_invalid` maps to
    /// [`SessionError::AuthenticationFailed`]; running out of `timeout` maps
    /// to [`SessionError::HandshakeTimeout`].
    pub async fn authenticate(
        &mut self,
        token: &SecretString,
        timeout: Duration,
    ) -> Result<Option<String>> {
        tokio::time::timeout(timeout, self.handshake(token))
            .await
            .map_err(|_| SessionError::HandshakeTimeout(timeout))?
    }

    async fn handshake(&mut self, token: &SecretString) -> Result<Option<String>> {
        let mut version = None;
        loop {
            let text = self.recv_text().await?.ok_or_else(|| {
                SessionError::Transport("Connection closed during auth handshake".to_string())
            })?;

            for frame in decode_message(&text) {
                match frame? {
                    InboundFrame::AuthRequired { ha_version } => {
                        debug!(hub_version = ?ha_version, "Hub requested authentication");
                        version = ha_version;
                        self.send_text(encode_auth(token.expose_secret())).await?;
                    }
                    InboundFrame::AuthOk { ha_version } => {
                        return Ok(ha_version.or(version));
                    }
                    InboundFrame::AuthInvalid { message } => {
                        return Err(SessionError::AuthenticationFailed(message));
                    }
                    other => {
                        debug!(frame = ?other, "Ignoring frame received during handshake");
                    }
                }
            }
        }
    }

    /// Split into separate sink and stream for concurrent send/receive.
    pub fn split(self) -> (WsSink, WsStream) {
        (self.sink, self.stream)
    }
}
