// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt::{self, Display, Formatter, Write};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::net::TcpStream;

use super::ProtocolError;

/// Socks5-like Address Field
///
/// # Protocol
///
/// | ATYP | DST.ADDR |
/// | ---- | -------- |
/// |  1   | Variable |
///
/// The ATYP byte values differ between protocols, see [`AddrTags`]. An IPv4
/// address is 4 octets, an IPv6 address is 16 octets and a domain name is a
/// length octet followed by that many bytes of name, no terminating NUL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

/// ATYP byte values of one protocol family.
///
/// Trojan and Shadowsocks use the Socks5 assignment, VLESS renumbers them.
pub struct AddrTags {
    pub v4: u8,
    pub domain: u8,
    pub v6: u8,
}

/// ATYP values shared by Trojan and Shadowsocks: 1=IPv4, 3=Domain, 4=IPv6.
pub const SOCKS_TAGS: AddrTags = AddrTags {
    v4: 1,
    domain: 3,
    v6: 4,
};

/// VLESS ATYP values: 1=IPv4, 2=Domain, 3=IPv6.
pub const VLESS_TAGS: AddrTags = AddrTags {
    v4: 1,
    domain: 2,
    v6: 3,
};

impl Address {
    /// Parse an address field starting at the ATYP byte.
    ///
    /// Returns the address and the number of bytes consumed, ATYP included.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::TooShort`] if `bytes` ends inside the field
    /// - [`ProtocolError::InvalidAddressType`] on an ATYP outside `tags`
    /// - [`ProtocolError::EmptyAddress`] on a zero-length domain name
    pub fn decode(bytes: &[u8], tags: &AddrTags) -> Result<(Address, usize), ProtocolError> {
        let atyp = *bytes.first().ok_or(ProtocolError::TooShort)?;

        if atyp == tags.v4 {
            let octets = bytes.get(1..5).ok_or(ProtocolError::TooShort)?;
            let octets = <[u8; 4]>::try_from(octets).unwrap();
            Ok((Address::V4(octets.into()), 5))
        } else if atyp == tags.domain {
            let len = *bytes.get(1).ok_or(ProtocolError::TooShort)? as usize;
            if len == 0 {
                return Err(ProtocolError::EmptyAddress(atyp));
            }
            let name = bytes.get(2..2 + len).ok_or(ProtocolError::TooShort)?;
            // lossy like a streaming text decoder, never a hard error
            let name = String::from_utf8_lossy(name).into_owned();
            Ok((Address::Domain(name), 2 + len))
        } else if atyp == tags.v6 {
            let octets = bytes.get(1..17).ok_or(ProtocolError::TooShort)?;
            let octets = <[u8; 16]>::try_from(octets).unwrap();
            Ok((Address::V6(octets.into()), 17))
        } else {
            Err(ProtocolError::InvalidAddressType(atyp))
        }
    }

    /// Textual host form: dotted IPv4, 8 lowercase hex groups for IPv6
    /// (never `::`-compressed, no brackets), or the domain name.
    pub fn host(&self) -> String {
        match self {
            Address::V4(ip) => ip.to_string(),
            Address::V6(ip) => {
                let mut out = String::new();
                for (i, group) in ip.segments().iter().enumerate() {
                    if i > 0 {
                        out.push(':');
                    }
                    let _ = write!(out, "{:x}", group);
                }
                out
            }
            Address::Domain(name) => name.clone(),
        }
    }

    /// Like [`Address::host`], with IPv6 wrapped in `[...]`.
    pub fn bracketed(&self) -> String {
        match self {
            Address::V6(_) => format!("[{}]", self.host()),
            _ => self.host(),
        }
    }

    /// Open a TCP stream to the specified port on this address.
    pub async fn open_tcp(&self, port: u16) -> io::Result<TcpStream> {
        match self {
            Address::V4(ip) => TcpStream::connect((*ip, port)).await,
            Address::V6(ip) => TcpStream::connect((*ip, port)).await,
            Address::Domain(name) => TcpStream::connect((name.as_str(), port)).await,
        }
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host())
    }
}
