// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shadowsocks Request
//!
//! # Protocol
//!
//! | ATYP | DST.ADDR | DST.PORT | Payload  |
//! | ---- | -------- | -------- | -------- |
//! |  1   | Variable |    2     | Variable |
//!
//! ATYP: 1=IPv4, 3=Domain, 4=IPv6. There is no command byte; the request is a
//! TCP stream unless it targets port 53, which is taken to be DNS.

use bytes::Bytes;

use super::{read_port, Address, ProtocolError, ProtocolKind, RouteInfo, Transport, SOCKS_TAGS};

pub(super) fn parse(frame: &Bytes) -> Result<RouteInfo, ProtocolError> {
    let (addr, consumed) = Address::decode(frame, &SOCKS_TAGS)?;
    let port = read_port(frame, consumed)?;

    let transport = if port == 53 {
        Transport::UdpDns
    } else {
        Transport::Tcp
    };

    Ok(RouteInfo {
        protocol: ProtocolKind::Shadowsocks,
        addr,
        port,
        transport,
        residual: frame.slice(consumed + 2..),
        prelude: None,
    })
}
