// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trojan Request
//!
//! # Protocol
//!
//! | Password |   CRLF    | CMD | ATYP | DST.ADDR | DST.PORT |   CRLF    | Payload  |
//! | -------- | --------- | --- | ---- | -------- | -------- | --------- | -------- |
//! |    56    | `b"\r\n"` |  1  |  1   | Variable |    2     | `b"\r\n"` | Variable |
//!
//! CMD: 1=TCP, 3=UDP. ATYP: 1=IPv4, 3=Domain, 4=IPv6. The 56-byte password
//! digest is not verified against any credential; the sniffer's marker test
//! is the only gate in front of this decoder.

use bytes::Bytes;

use super::{read_port, Address, ProtocolError, ProtocolKind, RouteInfo, Transport, SOCKS_TAGS};

pub(super) fn parse(frame: &Bytes) -> Result<RouteInfo, ProtocolError> {
    // password digest and CRLF at 0..58 were validated by the sniffer
    let request = frame.get(58..).ok_or(ProtocolError::TooShort)?;
    if request.len() < 6 {
        return Err(ProtocolError::TooShort);
    }

    let udp = match request[0] {
        0x01 => false,
        0x03 => true,
        cmd => return Err(ProtocolError::UnsupportedCommand(cmd)),
    };
    let (addr, consumed) = Address::decode(&request[1..], &SOCKS_TAGS)?;
    let port = read_port(request, 1 + consumed)?;

    // the terminating CRLF sits between the port and the payload
    let residual_offset = 58 + 1 + consumed + 2 + 2;

    Ok(RouteInfo {
        protocol: ProtocolKind::Trojan,
        addr,
        port,
        transport: Transport::from_request(udp, port)?,
        residual: frame.slice(residual_offset.min(frame.len())..),
        prelude: None,
    })
}
