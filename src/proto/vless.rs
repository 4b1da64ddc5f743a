// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! VLESS Request
//!
//! # Protocol
//!
//! | Version | UUID | OptLen | Options | CMD | DST.PORT | ATYP | DST.ADDR | Payload  |
//! | ------- | ---- | ------ | ------- | --- | -------- | ---- | -------- | -------- |
//! |    1    |  16  |   1    | OptLen  |  1  |    2     |  1   | Variable | Variable |
//!
//! CMD: 1=TCP, 2=UDP. ATYP: 1=IPv4, 2=Domain, 3=IPv6, renumbered from the
//! Socks5 assignment the other protocols use. The server acknowledges with
//! `{version, 0}` in front of its first downstream payload; the UUID is not
//! verified.

use bytes::Bytes;

use super::{read_port, Address, ProtocolError, ProtocolKind, RouteInfo, Transport, VLESS_TAGS};

pub(super) fn parse(frame: &Bytes) -> Result<RouteInfo, ProtocolError> {
    let version = *frame.first().ok_or(ProtocolError::TooShort)?;
    let opt_len = *frame.get(17).ok_or(ProtocolError::TooShort)? as usize;

    let cmd_offset = 18 + opt_len;
    let udp = match *frame.get(cmd_offset).ok_or(ProtocolError::TooShort)? {
        0x01 => false,
        0x02 => true,
        cmd => return Err(ProtocolError::UnsupportedCommand(cmd)),
    };
    let port = read_port(frame, cmd_offset + 1)?;

    let (addr, consumed) = Address::decode(&frame[cmd_offset + 3..], &VLESS_TAGS)?;

    Ok(RouteInfo {
        protocol: ProtocolKind::Vless,
        addr,
        port,
        transport: Transport::from_request(udp, port)?,
        residual: frame.slice(cmd_offset + 3 + consumed..),
        prelude: Some([version, 0x00]),
    })
}
