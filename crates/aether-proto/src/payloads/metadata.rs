//! Metadata payload: the encrypted first record of every tunnel stream.
//!
//! Carries the destination the client wants the gateway to dial, plus a
//! TLV option list. The payload never appears on the wire in the clear -
//! the dispatcher seals it and the gateway opens it before acting.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};

use crate::errors::{ProtocolError, Result};

/// TLV tag announcing the sender's padding ceiling (`len = 2`, value u16).
const OPTION_MAX_PADDING: u8 = 0x01;

/// Destination address inside a metadata payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// Literal IPv4 address (`addr_type = 1`, 4 bytes).
    Ipv4(Ipv4Addr),
    /// Literal IPv6 address (`addr_type = 2`, 16 bytes).
    Ipv6(Ipv6Addr),
    /// Hostname to be resolved by the gateway (`addr_type = 3`,
    /// length-prefixed UTF-8, 1-255 bytes).
    Domain(String),
}

impl TargetAddr {
    /// Wire discriminator for this address form.
    #[must_use]
    pub fn addr_type(&self) -> u8 {
        match self {
            Self::Ipv4(_) => 1,
            Self::Ipv6(_) => 2,
            Self::Domain(_) => 3,
        }
    }

    /// Host string as the dialer expects it (`IpAddr` display form or the
    /// bare domain).
    #[must_use]
    pub fn host(&self) -> String {
        match self {
            Self::Ipv4(ip) => ip.to_string(),
            Self::Ipv6(ip) => ip.to_string(),
            Self::Domain(domain) => domain.clone(),
        }
    }

    /// The literal IP, when this address is not a domain.
    #[must_use]
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Self::Ipv4(ip) => Some(IpAddr::V4(*ip)),
            Self::Ipv6(ip) => Some(IpAddr::V6(*ip)),
            Self::Domain(_) => None,
        }
    }
}

impl From<IpAddr> for TargetAddr {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => Self::Ipv4(v4),
            IpAddr::V6(v6) => Self::Ipv6(v6),
        }
    }
}

/// Plaintext of a Metadata record.
///
/// Layout: `addr_type: u8`, `port: u16`, address bytes, `options_length:
/// u16`, TLV options. Unknown option tags are skipped on decode so old
/// gateways tolerate new clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataPayload {
    /// Destination address.
    pub target: TargetAddr,
    /// Destination TCP port.
    pub port: u16,
    /// Sender's data-record padding ceiling, if announced.
    pub max_padding: Option<u16>,
}

impl MetadataPayload {
    /// Create a metadata payload for a host/port pair. Host strings that
    /// parse as IP literals become [`TargetAddr::Ipv4`]/[`TargetAddr::Ipv6`].
    ///
    /// # Errors
    ///
    /// - `ProtocolError::MalformedMetadata` if a domain is empty or longer
    ///   than 255 bytes
    pub fn for_host(host: &str, port: u16) -> Result<Self> {
        let target = match host.parse::<IpAddr>() {
            Ok(ip) => TargetAddr::from(ip),
            Err(_) => {
                if host.is_empty() {
                    return Err(ProtocolError::MalformedMetadata("empty domain"));
                }
                if host.len() > 255 {
                    return Err(ProtocolError::MalformedMetadata("domain longer than 255 bytes"));
                }
                TargetAddr::Domain(host.to_string())
            },
        };
        Ok(Self { target, port, max_padding: None })
    }

    /// Serialize to plaintext payload bytes (pre-seal).
    ///
    /// # Errors
    ///
    /// - `ProtocolError::MalformedMetadata` if the domain violates the
    ///   1-255 byte bound (possible when the struct was built directly)
    pub fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(self.target.addr_type());
        buf.put_u16(self.port);

        match &self.target {
            TargetAddr::Ipv4(ip) => buf.put_slice(&ip.octets()),
            TargetAddr::Ipv6(ip) => buf.put_slice(&ip.octets()),
            TargetAddr::Domain(domain) => {
                if domain.is_empty() {
                    return Err(ProtocolError::MalformedMetadata("empty domain"));
                }
                if domain.len() > 255 {
                    return Err(ProtocolError::MalformedMetadata("domain longer than 255 bytes"));
                }
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
            },
        }

        let mut options = BytesMut::new();
        if let Some(max_padding) = self.max_padding {
            options.put_u8(OPTION_MAX_PADDING);
            options.put_u8(2);
            options.put_u16(max_padding);
        }
        buf.put_u16(options.len() as u16);
        buf.put_slice(&options);

        Ok(buf)
    }

    /// Parse from decrypted payload bytes.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::MalformedMetadata` on truncation, an unknown
    ///   address type, a zero-length domain, non-UTF-8 domain bytes, or an
    ///   option list that overruns its declared length
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor { bytes, at: 0 };

        let addr_type = cursor.u8()?;
        let port = cursor.u16()?;

        let target = match addr_type {
            1 => {
                let octets: [u8; 4] = cursor
                    .take(4)?
                    .try_into()
                    .map_err(|_| ProtocolError::MalformedMetadata("short IPv4 address"))?;
                TargetAddr::Ipv4(Ipv4Addr::from(octets))
            },
            2 => {
                let octets: [u8; 16] = cursor
                    .take(16)?
                    .try_into()
                    .map_err(|_| ProtocolError::MalformedMetadata("short IPv6 address"))?;
                TargetAddr::Ipv6(Ipv6Addr::from(octets))
            },
            3 => {
                let len = cursor.u8()? as usize;
                if len == 0 {
                    return Err(ProtocolError::MalformedMetadata("empty domain"));
                }
                let raw = cursor.take(len)?;
                let domain = std::str::from_utf8(raw)
                    .map_err(|_| ProtocolError::MalformedMetadata("domain not valid UTF-8"))?;
                TargetAddr::Domain(domain.to_string())
            },
            _ => return Err(ProtocolError::MalformedMetadata("unknown address type")),
        };

        let options_length = cursor.u16()? as usize;
        let options = cursor.take(options_length)?;

        let mut max_padding = None;
        let mut at = 0;
        while at < options.len() {
            let tag = options[at];
            let len = *options
                .get(at + 1)
                .ok_or(ProtocolError::MalformedMetadata("option missing length"))? as usize;
            let value = options
                .get(at + 2..at + 2 + len)
                .ok_or(ProtocolError::MalformedMetadata("option value overruns list"))?;

            if tag == OPTION_MAX_PADDING {
                let raw: [u8; 2] = value
                    .try_into()
                    .map_err(|_| ProtocolError::MalformedMetadata("max_padding option not 2 bytes"))?;
                max_padding = Some(u16::from_be_bytes(raw));
            }
            // Unknown tags are skipped for forward compatibility.

            at += 2 + len;
        }

        Ok(Self { target, port, max_padding })
    }
}

/// Minimal bounds-checked reader over a byte slice.
struct Cursor<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let slice = self
            .bytes
            .get(self.at..self.at + n)
            .ok_or(ProtocolError::MalformedMetadata("payload truncated"))?;
        self.at += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let raw = self.take(2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }
}
