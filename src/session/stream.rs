// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use crate::utils::decode_early_data;

/// Client frames as an ordered byte-chunk stream
///
/// Early data smuggled through the handshake header comes first, then every
/// WebSocket data frame in arrival order. A close frame or the end of the
/// underlying stream ends the sequence; a malformed early-data header
/// surfaces as the first item instead of a chunk.
pub struct InboundChunks<S> {
    early: Option<io::Result<Bytes>>,
    ws: SplitStream<WebSocketStream<S>>,
}

impl<S> InboundChunks<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ws: SplitStream<WebSocketStream<S>>, early_header: Option<&str>) -> Self {
        let early = match decode_early_data(early_header) {
            Ok(buf) if buf.is_empty() => None,
            other => Some(other),
        };
        InboundChunks { early, ws }
    }

    /// Next byte chunk, `None` once the client side is done.
    pub async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        if let Some(early) = self.early.take() {
            return Some(early);
        }
        loop {
            return match self.ws.next().await? {
                Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
                Ok(Message::Text(text)) => Some(Ok(Bytes::from(text.into_bytes()))),
                Ok(Message::Close(_)) => None,
                // ping/pong are answered by the protocol layer
                Ok(_) => continue,
                Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => None,
                Err(e) => Some(Err(ws_io(e))),
            };
        }
    }
}

/// Close the client WebSocket, tolerating every already-closed state.
pub async fn safe_close<S>(tx: &mut SplitSink<WebSocketStream<S>, Message>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _ = tx.send(Message::Close(None)).await;
}

pub(crate) fn ws_io(e: WsError) -> io::Error {
    match e {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, "websocket closed")
        }
        e => io::Error::new(io::ErrorKind::Other, e),
    }
}
