// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt::{self, Display, Formatter};
use std::io;

use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::{alphabet, Engine};
use bytes::Bytes;

/// Standard-alphabet base64 that does not insist on padding.
const EARLY_DATA: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode the early-data bytes a client smuggles in its
/// `sec-websocket-protocol` request header.
///
/// The value is base64 with the url-safe substitutions applied by some
/// clients (`-` for `+`, `_` for `/`) and optional padding. An absent or
/// empty header is an empty buffer, not an error.
pub fn decode_early_data(header: Option<&str>) -> io::Result<Bytes> {
    let value = match header {
        Some(v) if !v.is_empty() => v,
        _ => return Ok(Bytes::new()),
    };

    let normalized: Vec<u8> = value
        .bytes()
        .map(|b| match b {
            b'-' => b'+',
            b'_' => b'/',
            b => b,
        })
        .collect();

    match EARLY_DATA.decode(normalized) {
        Ok(buf) => Ok(Bytes::from(buf)),
        Err(e) => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("early data: {}", e),
        )),
    }
}

/// Delimiters accepted between the host and port halves of an upstream hint.
const HINT_DELIMITERS: [char; 3] = [':', '=', '-'];

/// Alternate upstream target carried in the request path
///
/// The path segment is split once at the first of `:`, `=` or `-`. Either
/// half may come out empty or unparseable; the tunnel falls back to the
/// originally requested host or port for whatever is missing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamHint {
    pub host: String,
    pub port: Option<u16>,
}

impl UpstreamHint {
    pub fn parse(segment: &str) -> UpstreamHint {
        let (host, port) = match segment.find(HINT_DELIMITERS) {
            Some(i) => (&segment[..i], segment[i + 1..].parse::<u16>().ok()),
            None => (segment, None),
        };
        UpstreamHint {
            host: host.to_string(),
            port,
        }
    }
}

impl Display for UpstreamHint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}:{}", self.host, port),
            None => f.write_str(&self.host),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_data_absent_is_empty() {
        assert!(decode_early_data(None).unwrap().is_empty());
        assert!(decode_early_data(Some("")).unwrap().is_empty());
    }

    #[test]
    fn early_data_unpadded() {
        assert_eq!(&decode_early_data(Some("aGVsbG8")).unwrap()[..], b"hello");
        assert_eq!(&decode_early_data(Some("aGVsbG8=")).unwrap()[..], b"hello");
    }

    #[test]
    fn early_data_url_safe_alphabet() {
        // 0xfb 0xff is "+/8=" in the standard alphabet
        assert_eq!(&decode_early_data(Some("-_8")).unwrap()[..], &[0xfb, 0xff]);
        assert_eq!(&decode_early_data(Some("+/8=")).unwrap()[..], &[0xfb, 0xff]);
    }

    #[test]
    fn early_data_malformed() {
        assert!(decode_early_data(Some("!!!")).is_err());
    }

    #[test]
    fn hint_host_and_port() {
        let hint = UpstreamHint::parse("example.org-8443");
        assert_eq!(hint.host, "example.org");
        assert_eq!(hint.port, Some(8443));

        let hint = UpstreamHint::parse("proxy.example.net:443");
        assert_eq!(hint.port, Some(443));

        let hint = UpstreamHint::parse("1.2.3.4=80");
        assert_eq!(hint.host, "1.2.3.4");
        assert_eq!(hint.port, Some(80));
    }

    #[test]
    fn hint_splits_at_first_delimiter() {
        // a dashed hostname loses everything past its first dash
        let hint = UpstreamHint::parse("my-host.com:443");
        assert_eq!(hint.host, "my");
        assert_eq!(hint.port, None);
    }

    #[test]
    fn hint_empty_halves() {
        let hint = UpstreamHint::parse(":8443");
        assert_eq!(hint.host, "");
        assert_eq!(hint.port, Some(8443));

        let hint = UpstreamHint::parse("host:");
        assert_eq!(hint.host, "host");
        assert_eq!(hint.port, None);

        let hint = UpstreamHint::parse("host=99999");
        assert_eq!(hint.port, None);
    }
}
