// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Tunnel Sessions
//!
//! One session bridges one client WebSocket to one remote socket. The first
//! client chunk decides everything: it is sniffed, decoded into a
//! [`RouteInfo`] and its residual payload forwarded; every later chunk is
//! relayed verbatim. The remote's bytes stream back as binary frames, with
//! the protocol's response prelude stitched onto the first one.
//!
//! ``` text
//! AwaitFirst --(sniff+parse)--> Routed --(chunk)--> Routed
//!     |            |
//!     |            +-- udp:53 --> DNS-over-TCP bridge
//!     +-- decode/parse error --> closed
//! ```
//!
//! A remote that dies without ever producing a byte gets one second chance
//! through the upstream hint carried in the request path; see [`RetryPolicy`].

use std::io;
use std::net::SocketAddr;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::proto::{RouteInfo, Transport};
use crate::utils::UpstreamHint;

mod stream;
pub use stream::*;

const READ_BUF_LEN: usize = 8192;

/// How often a tunnel may re-dial after a silent remote
///
/// `OnceVia` degrades to `Never` when consumed, so a second silent remote
/// simply ends the tunnel.
pub enum RetryPolicy {
    Never,
    OnceVia(UpstreamHint),
}

impl RetryPolicy {
    fn take(&mut self) -> Option<UpstreamHint> {
        match std::mem::replace(self, RetryPolicy::Never) {
            RetryPolicy::OnceVia(hint) => Some(hint),
            RetryPolicy::Never => None,
        }
    }
}

/// A single client connection, from WebSocket accept to teardown
pub struct Tunnel<S> {
    ws: WebSocketStream<S>,
    early_header: Option<String>,
    retry: RetryPolicy,
    dns_server: SocketAddr,
    peer: SocketAddr,
}

impl<S> Tunnel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        ws: WebSocketStream<S>,
        early_header: Option<String>,
        retry: RetryPolicy,
        dns_server: SocketAddr,
        peer: SocketAddr,
    ) -> Tunnel<S> {
        Tunnel {
            ws,
            early_header,
            retry,
            dns_server,
            peer,
        }
    }

    pub async fn run(self) -> io::Result<()> {
        let Tunnel {
            ws,
            early_header,
            mut retry,
            dns_server,
            peer,
        } = self;

        let (tx, rx) = ws.split();
        let mut bridge = Bridge {
            chunks: InboundChunks::new(rx, early_header.as_deref()),
            tx,
            prelude: None,
            saw_remote_bytes: false,
        };

        // await the first non-empty chunk
        let first = loop {
            match bridge.chunks.next_chunk().await {
                None => {
                    safe_close(&mut bridge.tx).await;
                    return Ok(());
                }
                Some(Err(e)) => {
                    safe_close(&mut bridge.tx).await;
                    return Err(e);
                }
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => break chunk,
            }
        };

        let route = match RouteInfo::parse(&first) {
            Ok(route) => route,
            Err(e) => {
                log::debug!("{} rejected: {}", peer, e);
                safe_close(&mut bridge.tx).await;
                return Err(e.into());
            }
        };
        log::info!("{} open {}", peer, route);

        bridge.prelude = route.prelude.map(Vec::from);

        let result = match route.transport {
            Transport::Tcp => bridge.run_tcp(&route, &mut retry, peer).await,
            Transport::UdpDns => bridge.run_dns(&route, dns_server).await,
        };

        safe_close(&mut bridge.tx).await;
        result
    }
}

enum PumpEnd {
    RemoteClosed,
    ClientClosed,
}

enum PumpError {
    /// The remote read side failed; candidate for the one-shot retry
    Remote(io::Error),
    /// Everything else ends the tunnel
    Fatal(io::Error),
}

fn flatten(end: Result<PumpEnd, PumpError>) -> io::Result<()> {
    match end {
        Ok(_) => Ok(()),
        Err(PumpError::Remote(e)) | Err(PumpError::Fatal(e)) => Err(e),
    }
}

/// Both relay directions of one tunnel
///
/// Owns the only handle to the WebSocket send side and the response prelude,
/// which is consumed by the first remote-to-client frame and survives a
/// retry untouched if the first attempt never produced one.
struct Bridge<S> {
    chunks: InboundChunks<S>,
    tx: SplitSink<WebSocketStream<S>, Message>,
    prelude: Option<Vec<u8>>,
    saw_remote_bytes: bool,
}

impl<S> Bridge<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    async fn run_tcp(
        &mut self,
        route: &RouteInfo,
        retry: &mut RetryPolicy,
        peer: SocketAddr,
    ) -> io::Result<()> {
        let mut remote = route.addr.open_tcp(route.port).await?;
        if !route.residual.is_empty() {
            remote.write_all(&route.residual).await?;
        }
        let end = self.pump(remote).await;

        let hint = match &end {
            Ok(PumpEnd::RemoteClosed) | Err(PumpError::Remote(_)) if !self.saw_remote_bytes => {
                retry.take()
            }
            _ => None,
        };
        let hint = match hint {
            Some(hint) => hint,
            None => return flatten(end),
        };

        log::debug!(
            "{} no data from {}:{}, retrying via {}",
            peer,
            route.target(),
            route.port,
            hint
        );

        let mut remote = open_via_hint(&hint, route).await?;
        if !route.residual.is_empty() {
            remote.write_all(&route.residual).await?;
        }
        flatten(self.pump(remote).await)
    }

    async fn run_dns(&mut self, route: &RouteInfo, dns_server: SocketAddr) -> io::Result<()> {
        let mut remote = TcpStream::connect(dns_server).await?;
        if !route.residual.is_empty() {
            remote.write_all(&route.residual).await?;
        }
        flatten(self.pump(remote).await)
    }

    /// Run both pipelines over one remote socket until either side ends.
    async fn pump(&mut self, remote: TcpStream) -> Result<PumpEnd, PumpError> {
        let (mut remote_rx, mut remote_tx) = remote.into_split();
        let chunks = &mut self.chunks;
        let tx = &mut self.tx;
        let prelude = &mut self.prelude;
        let saw_remote_bytes = &mut self.saw_remote_bytes;

        let uplink = async move {
            while let Some(chunk) = chunks.next_chunk().await {
                let chunk = chunk.map_err(PumpError::Fatal)?;
                remote_tx.write_all(&chunk).await.map_err(PumpError::Fatal)?;
            }
            let _ = remote_tx.shutdown().await;
            Ok(PumpEnd::ClientClosed)
        };

        let downlink = async move {
            let mut buf = [0u8; READ_BUF_LEN];
            loop {
                let n = remote_rx.read(&mut buf).await.map_err(PumpError::Remote)?;
                if n == 0 {
                    return Ok(PumpEnd::RemoteClosed);
                }
                *saw_remote_bytes = true;
                let frame = match prelude.take() {
                    Some(mut first) => {
                        first.extend_from_slice(&buf[..n]);
                        first
                    }
                    None => buf[..n].to_vec(),
                };
                tx.send(Message::Binary(frame))
                    .await
                    .map_err(|e| PumpError::Fatal(ws_io(e)))?;
            }
        };

        tokio::select! {
            end = uplink => end,
            end = downlink => end,
        }
    }
}

async fn open_via_hint(hint: &UpstreamHint, route: &RouteInfo) -> io::Result<TcpStream> {
    let port = hint.port.unwrap_or(route.port);
    if hint.host.is_empty() {
        route.addr.open_tcp(port).await
    } else {
        TcpStream::connect((hint.host.as_str(), port)).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use tokio::io::DuplexStream;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::protocol::Role;

    // 550e8400-e29b-41d4-a716-446655440000
    const UUID_V4: [u8; 16] = [
        0x55, 0x0e, 0x84, 0x00, 0xe2, 0x9b, 0x41, 0xd4, 0xa7, 0x16, 0x44, 0x66, 0x55, 0x44, 0x00,
        0x00,
    ];

    pub(crate) async fn ws_pair() -> (
        WebSocketStream<DuplexStream>,
        WebSocketStream<DuplexStream>,
    ) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(client, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(server, Role::Server, None).await;
        (client, server)
    }

    fn vless_first_frame(port: u16, residual: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x00];
        frame.extend(UUID_V4);
        frame.push(0); // no options
        frame.push(0x01); // tcp
        frame.extend(port.to_be_bytes());
        frame.push(0x01); // ipv4
        frame.extend([127, 0, 0, 1]);
        frame.extend(residual);
        frame
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn unused_dns() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    async fn drain(mut client: WebSocketStream<DuplexStream>) {
        while let Some(msg) = client.next().await {
            if msg.is_err() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn vless_tunnel_relays_with_prelude() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let remote = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"PAY");
            sock.write_all(b"OK").await.unwrap();
            let mut rest = Vec::new();
            sock.read_to_end(&mut rest).await.unwrap();
            assert_eq!(rest, b"MORE");
        });

        let (mut client, server) = ws_pair().await;
        let tunnel = Tunnel::new(server, None, RetryPolicy::Never, unused_dns(), peer());
        let task = tokio::spawn(tunnel.run());

        client
            .send(Message::Binary(vless_first_frame(port, b"PAY")))
            .await
            .unwrap();
        client.send(Message::Binary(b"MORE".to_vec())).await.unwrap();

        // single frame: prelude followed by the first remote payload
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.into_data(), b"\x00\x00OK");

        client.send(Message::Close(None)).await.unwrap();
        drain(client).await;

        task.await.unwrap().unwrap();
        remote.await.unwrap();
    }

    #[tokio::test]
    async fn early_data_reaches_the_remote() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let remote = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"PAY");
            sock.write_all(b"PONG").await.unwrap();
        });

        let header = URL_SAFE_NO_PAD.encode(vless_first_frame(port, b"PAY"));
        let (mut client, server) = ws_pair().await;
        let tunnel = Tunnel::new(
            server,
            Some(header),
            RetryPolicy::Never,
            unused_dns(),
            peer(),
        );
        let task = tokio::spawn(tunnel.run());

        // no frame sent: the handshake header already carried the request
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.into_data(), b"\x00\x00PONG");

        drain(client).await;
        task.await.unwrap().unwrap();
        remote.await.unwrap();
    }

    #[tokio::test]
    async fn zero_byte_remote_triggers_single_retry() {
        let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let first_port = first.local_addr().unwrap().port();
        let second = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let second_port = second.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut sock, _) = first.accept().await.unwrap();
            let mut buf = [0u8; 3];
            // drain the request, then close without answering
            sock.read_exact(&mut buf).await.unwrap();
        });
        let upstream = tokio::spawn(async move {
            let (mut sock, _) = second.accept().await.unwrap();
            let mut buf = [0u8; 3];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"PAY");
            sock.write_all(b"VIA").await.unwrap();
        });

        let hint = UpstreamHint {
            host: "127.0.0.1".into(),
            port: Some(second_port),
        };
        let (mut client, server) = ws_pair().await;
        let tunnel = Tunnel::new(
            server,
            None,
            RetryPolicy::OnceVia(hint),
            unused_dns(),
            peer(),
        );
        let task = tokio::spawn(tunnel.run());

        client
            .send(Message::Binary(vless_first_frame(first_port, b"PAY")))
            .await
            .unwrap();

        // the prelude survives the retry and prefixes the upstream's reply
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.into_data(), b"\x00\x00VIA");

        drain(client).await;
        task.await.unwrap().unwrap();
        upstream.await.unwrap();
    }

    #[tokio::test]
    async fn dns_chunks_go_to_the_resolver() {
        let resolver = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dns_server = resolver.local_addr().unwrap();

        let stub = tokio::spawn(async move {
            let (mut sock, _) = resolver.accept().await.unwrap();
            let mut buf = [0u8; 6];
            sock.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"\x00\x04QURY");
            sock.write_all(b"ANSWER").await.unwrap();
        });

        // shadowsocks to 8.8.8.8:53; the bridge must dial the stub instead
        let mut frame = vec![1u8, 8, 8, 8, 8];
        frame.extend(53u16.to_be_bytes());
        frame.extend(b"\x00\x04QURY");

        let (mut client, server) = ws_pair().await;
        let tunnel = Tunnel::new(server, None, RetryPolicy::Never, dns_server, peer());
        let task = tokio::spawn(tunnel.run());

        client.send(Message::Binary(frame)).await.unwrap();

        // no prelude for shadowsocks
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.into_data(), b"ANSWER");

        drain(client).await;
        task.await.unwrap().unwrap();
        stub.await.unwrap();
    }

    #[tokio::test]
    async fn close_before_first_chunk_is_clean() {
        let (mut client, server) = ws_pair().await;
        let tunnel = Tunnel::new(server, None, RetryPolicy::Never, unused_dns(), peer());
        let task = tokio::spawn(tunnel.run());

        client.send(Message::Close(None)).await.unwrap();
        drain(client).await;

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn parse_error_closes_the_tunnel() {
        let (mut client, server) = ws_pair().await;
        let tunnel = Tunnel::new(server, None, RetryPolicy::Never, unused_dns(), peer());
        let task = tokio::spawn(tunnel.run());

        // shadowsocks fallback with an unknown address tag
        client
            .send(Message::Binary(vec![9, 1, 2, 3, 4, 0, 80]))
            .await
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        drain(client).await;
    }
}
