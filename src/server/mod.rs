// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Gateway Server
//!
//! Accepts plain TCP, upgrades to WebSocket and hands the connection to a
//! [`Tunnel`]. TLS is terminated by the hosting runtime in front of this
//! process.
//!
//! The request path must match `/Free-VPN-Geo-Project/<host[:=-]port>`; the
//! trailing segment becomes the tunnel's [`UpstreamHint`]. Anything else is
//! answered with 404 before the upgrade completes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::StatusCode;

use crate::session::{ws_io, RetryPolicy, Tunnel};
use crate::utils::UpstreamHint;

/// Path prefix in front of the upstream-hint segment.
pub const TUNNEL_PATH_PREFIX: &str = "/Free-VPN-Geo-Project/";

pub struct ServerContext {
    /// Resolver for DNS-over-TCP bridging of UDP:53 requests
    pub dns_server: SocketAddr,
}

pub struct Server {
    pub bind: SocketAddr,
    pub ctx: Arc<ServerContext>,
}

impl Server {
    pub async fn run(self) -> io::Result<()> {
        let tcp = TcpListener::bind(self.bind).await?;

        log::info!("listen on {}/tcp", self.bind);
        loop {
            let (stream, src) = match tcp.accept().await {
                Ok(x) => x,
                Err(e) => {
                    log::error!("tcp accept: {}", e);
                    continue;
                }
            };
            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = accept_tunnel(stream, src, ctx).await {
                    log::debug!("{} closed: {}", src, e);
                }
            });
        }
    }
}

async fn accept_tunnel(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<ServerContext>,
) -> io::Result<()> {
    let _ = stream.set_nodelay(true);

    let mut hint = None;
    let mut early_header = None;

    let callback = |req: &Request, mut resp: Response| {
        match tunnel_path(req.uri().path()) {
            Some(segment) => hint = Some(UpstreamHint::parse(segment)),
            None => {
                log::warn!("{} unknown path {}", peer, req.uri().path());
                let reject = Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(None)
                    .unwrap();
                return Err(reject);
            }
        }
        if let Some(value) = req.headers().get(SEC_WEBSOCKET_PROTOCOL) {
            early_header = Some(String::from_utf8_lossy(value.as_bytes()).into_owned());
            // echo the subprotocol or negotiating clients drop the upgrade
            resp.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value.clone());
        }
        Ok(resp)
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(ws_io)?;

    let retry = match hint {
        Some(hint) => RetryPolicy::OnceVia(hint),
        None => RetryPolicy::Never,
    };
    Tunnel::new(ws, early_header, retry, ctx.dns_server, peer)
        .run()
        .await
}

/// Match a request path and return the upstream-hint segment.
///
/// Equivalent to `^/Free-VPN-Geo-Project/(.+[:=\-]\d+)$`: at least one
/// character, then a delimiter, then only digits up to the end.
fn tunnel_path(path: &str) -> Option<&str> {
    let segment = path.strip_prefix(TUNNEL_PATH_PREFIX)?;
    let delim = segment.rfind([':', '=', '-'])?;
    let digits = &segment[delim + 1..];
    if delim == 0 || digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(segment)
}
