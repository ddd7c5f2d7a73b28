use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::socks::{SocksError, SocksResult};

/// SOCKS5 address type tags
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Longest domain name the one-byte length prefix can carry
pub const MAX_DOMAIN_LEN: usize = 255;

/// Host part of a SOCKS5 address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Domain(String),
}

/// Destination (or bound) address as carried in SOCKS5 requests and replies.
///
/// When the address was read off the wire, `raw` keeps the exact bytes that
/// were received (type tag through port) so the request can be forwarded to
/// an upstream without re-encoding. Two addresses compare equal when host and
/// port match, whether or not either carries the raw form.
#[derive(Debug, Clone)]
pub struct TargetAddr {
    host: Host,
    port: u16,
    raw: Option<Bytes>,
}

impl TargetAddr {
    pub fn new(host: Host, port: u16) -> Self {
        Self {
            host,
            port,
            raw: None,
        }
    }

    /// Build a domain address, rejecting names the wire format cannot carry
    #[cfg(test)]
    pub fn domain(name: impl Into<String>, port: u16) -> SocksResult<Self> {
        let name = name.into();
        validate_domain(name.as_bytes())?;
        Ok(Self::new(Host::Domain(name), port))
    }

    /// `0.0.0.0:0`, used as the bound address of failure replies
    pub fn unspecified() -> Self {
        Self::new(Host::Ipv4(Ipv4Addr::UNSPECIFIED), 0)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The bytes this address was decoded from, if it came off the wire
    #[cfg(test)]
    pub fn raw(&self) -> Option<&Bytes> {
        self.raw.as_ref()
    }

    /// Length of the encoded form (type tag, address, port)
    pub fn encoded_len(&self) -> usize {
        match &self.host {
            Host::Ipv4(_) => 1 + 4 + 2,
            Host::Ipv6(_) => 1 + 16 + 2,
            Host::Domain(name) => 1 + 1 + name.len() + 2,
        }
    }

    /// Serialize the address field from the parsed values
    pub fn encode(&self, buf: &mut BytesMut) -> SocksResult<()> {
        buf.reserve(self.encoded_len());
        match &self.host {
            Host::Ipv4(ip) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&ip.octets());
            }
            Host::Ipv6(ip) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&ip.octets());
            }
            Host::Domain(name) => {
                validate_domain(name.as_bytes())?;
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(name.len() as u8);
                buf.put_slice(name.as_bytes());
            }
        }
        buf.put_u16(self.port);
        Ok(())
    }

    /// Serialize the address field, reusing the captured raw form when present
    pub fn write_to(&self, buf: &mut BytesMut) -> SocksResult<()> {
        match &self.raw {
            Some(raw) => {
                buf.put_slice(raw);
                Ok(())
            }
            None => self.encode(buf),
        }
    }

    /// Read a complete address field (type tag first) from `reader`
    pub async fn read_from<R>(reader: &mut R) -> SocksResult<Self>
    where
        R: AsyncRead + Unpin,
    {
        let atyp = reader.read_u8().await?;
        Self::read_after_atyp(reader, atyp).await
    }

    /// Read the remainder of an address field whose type tag was already consumed.
    ///
    /// Always consumes exactly the bytes the tag announces, so the stream stays
    /// aligned for whatever follows.
    pub async fn read_after_atyp<R>(reader: &mut R, atyp: u8) -> SocksResult<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut raw = BytesMut::with_capacity(1 + 1 + MAX_DOMAIN_LEN + 2);
        raw.put_u8(atyp);

        let host = match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await?;
                raw.put_slice(&octets);
                Host::Ipv4(Ipv4Addr::from(octets))
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await?;
                raw.put_slice(&octets);
                Host::Ipv6(Ipv6Addr::from(octets))
            }
            ATYP_DOMAIN => {
                let len = reader.read_u8().await? as usize;
                let mut name = vec![0u8; len];
                reader.read_exact(&mut name).await?;
                raw.put_u8(len as u8);
                raw.put_slice(&name);
                validate_domain(&name)?;
                // validate_domain guarantees ASCII
                Host::Domain(String::from_utf8_lossy(&name).into_owned())
            }
            other => return Err(SocksError::UnknownAddressType(other)),
        };

        let port = reader.read_u16().await?;
        raw.put_u16(port);

        Ok(Self {
            host,
            port,
            raw: Some(raw.freeze()),
        })
    }
}

fn validate_domain(name: &[u8]) -> SocksResult<()> {
    if name.len() > MAX_DOMAIN_LEN {
        return Err(SocksError::DomainTooLong(name.len()));
    }
    if name.is_empty() {
        return Err(SocksError::ProtocolViolation("empty domain name".into()));
    }
    if !name.is_ascii() {
        return Err(SocksError::ProtocolViolation(
            "domain name is not ASCII".into(),
        ));
    }
    Ok(())
}

impl PartialEq for TargetAddr {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for TargetAddr {}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        let host = match addr.ip() {
            IpAddr::V4(ip) => Host::Ipv4(ip),
            IpAddr::V6(ip) => Host::Ipv6(ip),
        };
        Self::new(host, addr.port())
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ipv4(ip) => write!(f, "{}:{}", ip, self.port),
            Host::Ipv6(ip) => write!(f, "[{}]:{}", ip, self.port),
            Host::Domain(name) => write!(f, "{}:{}", name, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(addr: &TargetAddr) -> TargetAddr {
        let mut buf = BytesMut::new();
        addr.encode(&mut buf).expect("encodable address");
        assert_eq!(buf.len(), addr.encoded_len());

        let mut reader = &buf[..];
        let decoded = TargetAddr::read_from(&mut reader).await.expect("decodable");
        assert!(reader.is_empty(), "decoder left {} bytes", reader.len());
        assert_eq!(decoded.raw().map(|r| &r[..]), Some(&buf[..]));
        decoded
    }

    #[tokio::test]
    async fn test_round_trip_each_kind() {
        let samples = vec![
            TargetAddr::new(Host::Ipv4(Ipv4Addr::new(93, 184, 216, 34)), 443),
            TargetAddr::new(Host::Ipv4(Ipv4Addr::BROADCAST), 65535),
            TargetAddr::new(Host::Ipv6(Ipv6Addr::LOCALHOST), 1),
            TargetAddr::new(
                Host::Ipv6("2001:db8::8a2e:370:7334".parse().unwrap()),
                8080,
            ),
            TargetAddr::domain("example.com", 80).unwrap(),
            TargetAddr::domain("a", 53).unwrap(),
            TargetAddr::domain("x".repeat(MAX_DOMAIN_LEN), 9).unwrap(),
        ];

        for addr in &samples {
            assert_eq!(&round_trip(addr).await, addr);
        }
    }

    #[test]
    fn test_domain_wire_layout() {
        let addr = TargetAddr::domain("example.com", 80).unwrap();
        let mut buf = BytesMut::new();
        addr.encode(&mut buf).unwrap();

        let mut expected = vec![ATYP_DOMAIN, 11];
        expected.extend_from_slice(b"example.com");
        expected.extend_from_slice(&[0x00, 0x50]);
        assert_eq!(&buf[..], &expected[..]);
    }

    #[test]
    fn test_ipv4_wire_layout() {
        let addr: TargetAddr = "10.1.2.3:258".parse::<SocketAddr>().unwrap().into();
        let mut buf = BytesMut::new();
        addr.encode(&mut buf).unwrap();
        assert_eq!(&buf[..], &[ATYP_IPV4, 10, 1, 2, 3, 0x01, 0x02]);
    }

    #[test]
    fn test_domain_too_long_rejected() {
        let long = "a".repeat(MAX_DOMAIN_LEN + 1);
        assert!(matches!(
            TargetAddr::domain(long.clone(), 80),
            Err(SocksError::DomainTooLong(256))
        ));

        // Bypassing the constructor still fails at encode time
        let addr = TargetAddr::new(Host::Domain(long), 80);
        let mut buf = BytesMut::new();
        assert!(matches!(
            addr.encode(&mut buf),
            Err(SocksError::DomainTooLong(256))
        ));
    }

    #[tokio::test]
    async fn test_unknown_address_type() {
        let bytes = [0x02u8, 1, 2, 3, 4, 0, 80];
        let mut reader = &bytes[..];
        let err = TargetAddr::read_from(&mut reader).await.unwrap_err();
        assert!(matches!(err, SocksError::UnknownAddressType(0x02)));
        assert!(err.is_protocol_violation());
    }

    #[tokio::test]
    async fn test_truncated_address_is_io_error() {
        let bytes = [ATYP_IPV6, 0, 0, 0];
        let mut reader = &bytes[..];
        let err = TargetAddr::read_from(&mut reader).await.unwrap_err();
        assert!(matches!(err, SocksError::Io(_)));
    }

    #[tokio::test]
    async fn test_raw_form_reused_verbatim() {
        let bytes = [ATYP_DOMAIN, 3, b'F', b'o', b'O', 0x01, 0xbb];
        let mut reader = &bytes[..];
        let addr = TargetAddr::read_from(&mut reader).await.unwrap();

        let mut out = BytesMut::new();
        addr.write_to(&mut out).unwrap();
        assert_eq!(&out[..], &bytes[..]);
        assert_eq!(addr.to_string(), "FoO:443");
    }

    #[test]
    fn test_display() {
        let v6 = TargetAddr::new(Host::Ipv6(Ipv6Addr::LOCALHOST), 1080);
        assert_eq!(v6.to_string(), "[::1]:1080");
        assert_eq!(TargetAddr::unspecified().to_string(), "0.0.0.0:0");
    }

    #[test]
    fn test_equality_ignores_raw_form() {
        let plain = TargetAddr::domain("example.com", 80).unwrap();
        let mut with_raw = plain.clone();
        with_raw.raw = Some(Bytes::from_static(b"whatever"));
        assert_eq!(plain, with_raw);
    }
}
