use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::util::{allocate_vec, join_host_port};

pub const ADDR_TYPE_IPV4: u8 = 0x01;
pub const ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
pub const ADDR_TYPE_IPV6: u8 = 0x04;

const MAX_HOSTNAME_LEN: usize = 255;

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum Address {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Hostname(String),
}

impl Address {
    pub fn from(s: &str) -> std::io::Result<Self> {
        let mut dots = 0;
        let mut possible_ipv4 = true;
        let mut possible_ipv6 = true;
        let mut possible_hostname = true;
        for b in s.as_bytes().iter() {
            let c = *b;
            if c == b':' {
                possible_ipv4 = false;
                possible_hostname = false;
                break;
            } else if c == b'.' {
                possible_ipv6 = false;
                dots += 1;
                if dots > 3 {
                    // can only be a hostname.
                    break;
                }
            } else if (c >= b'A' && c <= b'F') || (c >= b'a' && c <= b'f') {
                possible_ipv4 = false;
            } else if c < b'0' || c > b'9' {
                possible_ipv4 = false;
                possible_ipv6 = false;
                break;
            }
        }

        if possible_ipv4 && dots == 3 {
            if let Ok(addr) = s.parse::<Ipv4Addr>() {
                return Ok(Address::Ipv4(addr));
            }
        }

        if possible_ipv6 {
            if let Ok(addr) = s.parse::<Ipv6Addr>() {
                return Ok(Address::Ipv6(addr));
            }
        }

        if possible_hostname {
            return Ok(Address::Hostname(s.to_string()));
        }

        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Failed to parse address: {}", s),
        ))
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, Address::Ipv6(_))
    }

    pub fn is_hostname(&self) -> bool {
        matches!(self, Address::Hostname(_))
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Address::Hostname(ref hostname) => Some(hostname),
            _ => None,
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ipv4(addr) => addr.fmt(f),
            Address::Ipv6(addr) => addr.fmt(f),
            Address::Hostname(hostname) => hostname.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct NetLocation {
    address: Address,
    port: u16,
}

impl NetLocation {
    pub fn new(address: Address, port: u16) -> Self {
        Self { address, port }
    }

    pub fn from_str(s: &str, default_port: Option<u16>) -> std::io::Result<Self> {
        // Bracketed ipv6 literals, eg. [::1]:443
        if let Some(stripped) = s.strip_prefix('[') {
            let end = stripped.find(']').ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Unterminated ipv6 literal: {}", s),
                )
            })?;
            let addr = stripped[0..end].parse::<Ipv6Addr>().map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, format!("Bad ipv6: {}", e))
            })?;
            let port = match stripped[end + 1..].strip_prefix(':') {
                Some(port_str) => port_str.parse::<u16>().map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, format!("Bad port: {}", e))
                })?,
                None => default_port.ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::InvalidData, "No port")
                })?,
            };
            return Ok(Self {
                address: Address::Ipv6(addr),
                port,
            });
        }

        let (address_str, port, expect_ipv6) = match s.rfind(':') {
            Some(i) => {
                // The ':' could be from an unbracketed ipv6 address.
                match s[i + 1..].parse::<u16>() {
                    Ok(port) => (&s[0..i], Some(port), false),
                    Err(_) => (s, default_port, true),
                }
            }
            None => (s, default_port, false),
        };

        let address = Address::from(address_str)?;
        if expect_ipv6 && !address.is_ipv6() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Invalid location: {}", s),
            ));
        }

        let port = port
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "No port"))?;

        Ok(Self { address, port })
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        let address = match addr.ip() {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        };
        Self {
            address,
            port: addr.port(),
        }
    }

    pub fn components(&self) -> (&Address, u16) {
        (&self.address, self.port)
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The address in dialable `host:port` form, bracketing ipv6 literals.
    pub fn to_dial_string(&self) -> String {
        join_host_port(&self.address.to_string(), self.port)
    }
}

impl std::fmt::Display for NetLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_dial_string())
    }
}

/// Read a SOCKS address triple (type tag, address, big-endian port) from a
/// stream.
pub async fn read_address<R>(stream: &mut R) -> std::io::Result<NetLocation>
where
    R: AsyncRead + Unpin,
{
    let mut data = [0u8; 1];
    stream.read_exact(&mut data).await?;
    let address_type = data[0];

    match address_type {
        ADDR_TYPE_IPV4 => {
            let mut address_bytes = [0u8; 6];
            stream.read_exact(&mut address_bytes).await?;

            let v4addr = Ipv4Addr::new(
                address_bytes[0],
                address_bytes[1],
                address_bytes[2],
                address_bytes[3],
            );
            let port = u16::from_be_bytes([address_bytes[4], address_bytes[5]]);

            Ok(NetLocation::new(Address::Ipv4(v4addr), port))
        }
        ADDR_TYPE_IPV6 => {
            let mut address_bytes = [0u8; 18];
            stream.read_exact(&mut address_bytes).await?;

            let mut octets = [0u8; 16];
            octets.copy_from_slice(&address_bytes[0..16]);
            let v6addr = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([address_bytes[16], address_bytes[17]]);

            Ok(NetLocation::new(Address::Ipv6(v6addr), port))
        }
        ADDR_TYPE_DOMAIN_NAME => {
            stream.read_exact(&mut data).await?;
            let address_len = data[0] as usize;

            let mut address_bytes = allocate_vec(address_len + 2);
            stream.read_exact(&mut address_bytes).await?;

            let address_str = match std::str::from_utf8(&address_bytes[0..address_len]) {
                Ok(s) => s,
                Err(e) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("Failed to decode address: {}", e),
                    ));
                }
            };
            let port = u16::from_be_bytes([address_bytes[address_len], address_bytes[address_len + 1]]);

            // Some clients pass IP literals with the domain name tag, so parse
            // rather than using Address::Hostname directly.
            Ok(NetLocation::new(Address::from(address_str)?, port))
        }
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Unknown address type: {}", address_type),
        )),
    }
}

/// Parse a SOCKS address triple out of a byte slice, returning the location
/// and the number of bytes consumed.
pub fn parse_address(data: &[u8]) -> std::io::Result<(NetLocation, usize)> {
    if data.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "Empty address",
        ));
    }

    let address_type = data[0];
    match address_type {
        ADDR_TYPE_IPV4 => {
            if data.len() < 1 + 4 + 2 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Address too short for ipv4",
                ));
            }
            let v4addr = Ipv4Addr::new(data[1], data[2], data[3], data[4]);
            let port = u16::from_be_bytes([data[5], data[6]]);
            Ok((NetLocation::new(Address::Ipv4(v4addr), port), 1 + 4 + 2))
        }
        ADDR_TYPE_IPV6 => {
            if data.len() < 1 + 16 + 2 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Address too short for ipv6",
                ));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[1..17]);
            let v6addr = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([data[17], data[18]]);
            Ok((NetLocation::new(Address::Ipv6(v6addr), port), 1 + 16 + 2))
        }
        ADDR_TYPE_DOMAIN_NAME => {
            if data.len() < 2 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Address too short for domain length",
                ));
            }
            let address_len = data[1] as usize;
            let total_len = 1 + 1 + address_len + 2;
            if data.len() < total_len {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "Address too short for domain",
                ));
            }
            let address_str = match std::str::from_utf8(&data[2..2 + address_len]) {
                Ok(s) => s,
                Err(e) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("Failed to decode address: {}", e),
                    ));
                }
            };
            let port = u16::from_be_bytes([data[2 + address_len], data[3 + address_len]]);
            Ok((NetLocation::new(Address::from(address_str)?, port), total_len))
        }
        _ => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("Unknown address type: {}", address_type),
        )),
    }
}

/// Append a SOCKS address triple to `buf`. `None` encodes as an all-zero
/// ipv4 address with port zero. Ipv4-mapped ipv6 addresses are written in
/// their 4-byte form.
pub fn encode_address(location: Option<&NetLocation>, buf: &mut Vec<u8>) -> std::io::Result<()> {
    let location = match location {
        Some(location) => location,
        None => {
            buf.extend_from_slice(&[ADDR_TYPE_IPV4, 0, 0, 0, 0, 0, 0]);
            return Ok(());
        }
    };

    let (address, port) = location.components();
    match address {
        Address::Ipv4(v4addr) => {
            buf.push(ADDR_TYPE_IPV4);
            buf.extend_from_slice(&v4addr.octets());
        }
        Address::Ipv6(v6addr) => match v6addr.to_ipv4_mapped() {
            Some(v4addr) => {
                buf.push(ADDR_TYPE_IPV4);
                buf.extend_from_slice(&v4addr.octets());
            }
            None => {
                buf.push(ADDR_TYPE_IPV6);
                buf.extend_from_slice(&v6addr.octets());
            }
        },
        Address::Hostname(hostname) => {
            let hostname_bytes = hostname.as_bytes();
            if hostname_bytes.len() > MAX_HOSTNAME_LEN {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("Hostname too long: {} bytes", hostname_bytes.len()),
                ));
            }
            buf.push(ADDR_TYPE_DOMAIN_NAME);
            buf.push(hostname_bytes.len() as u8);
            buf.extend_from_slice(hostname_bytes);
        }
    }

    buf.extend_from_slice(&port.to_be_bytes());
    Ok(())
}

/// Parse a `host:port` string and append its SOCKS encoding to `buf`.
pub fn encode_address_from_str(addr: &str, buf: &mut Vec<u8>) -> std::io::Result<()> {
    let location = NetLocation::from_str(addr, None)?;
    encode_address(Some(&location), buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(location: NetLocation) {
        let mut buf = Vec::new();
        encode_address(Some(&location), &mut buf).unwrap();
        let (parsed, consumed) = parse_address(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(parsed, location);
    }

    #[test]
    fn test_roundtrip_ipv4() {
        roundtrip(NetLocation::new(
            Address::Ipv4(Ipv4Addr::new(127, 0, 0, 1)),
            1080,
        ));
    }

    #[test]
    fn test_roundtrip_ipv6() {
        roundtrip(NetLocation::new(
            Address::Ipv6("2001:4860:4860::8888".parse().unwrap()),
            53,
        ));
    }

    #[test]
    fn test_roundtrip_hostname() {
        roundtrip(NetLocation::new(
            Address::Hostname("example.com".to_string()),
            443,
        ));
    }

    #[test]
    fn test_encode_none_is_zero_ipv4() {
        let mut buf = Vec::new();
        encode_address(None, &mut buf).unwrap();
        assert_eq!(buf, [ADDR_TYPE_IPV4, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_ipv4_mapped_ipv6_as_ipv4() {
        let mapped: Ipv6Addr = "::ffff:8.8.8.8".parse().unwrap();
        let mut buf = Vec::new();
        encode_address(
            Some(&NetLocation::new(Address::Ipv6(mapped), 53)),
            &mut buf,
        )
        .unwrap();
        assert_eq!(buf, [ADDR_TYPE_IPV4, 8, 8, 8, 8, 0, 53]);
    }

    #[test]
    fn test_encode_oversize_hostname_fails() {
        let long_name = "a".repeat(256);
        let mut buf = Vec::new();
        let result = encode_address(
            Some(&NetLocation::new(Address::Hostname(long_name), 80)),
            &mut buf,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_unknown_tag_fails() {
        let data = [0x02u8, 0, 0, 0, 0, 0, 0];
        assert!(parse_address(&data).is_err());
    }

    #[test]
    fn test_parse_short_input_fails() {
        let data = [ADDR_TYPE_IPV4, 127, 0];
        assert!(parse_address(&data).is_err());
    }

    #[tokio::test]
    async fn test_read_address_from_stream() {
        let mut buf = Vec::new();
        encode_address(
            Some(&NetLocation::new(
                Address::Hostname("dns.google".to_string()),
                853,
            )),
            &mut buf,
        )
        .unwrap();

        let mut reader = std::io::Cursor::new(buf);
        let location = read_address(&mut reader).await.unwrap();
        assert_eq!(location.address(), &Address::Hostname("dns.google".to_string()));
        assert_eq!(location.port(), 853);
    }

    #[test]
    fn test_from_str_variants() {
        let loc = NetLocation::from_str("example.com:80", None).unwrap();
        assert_eq!(loc.address(), &Address::Hostname("example.com".to_string()));
        assert_eq!(loc.port(), 80);

        let loc = NetLocation::from_str("10.0.0.1:8080", None).unwrap();
        assert_eq!(loc.address(), &Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1)));

        let loc = NetLocation::from_str("[::1]:443", None).unwrap();
        assert!(loc.address().is_ipv6());
        assert_eq!(loc.port(), 443);

        let loc = NetLocation::from_str("example.com", Some(443)).unwrap();
        assert_eq!(loc.port(), 443);

        assert!(NetLocation::from_str("example.com", None).is_err());
        assert!(NetLocation::from_str("example.com:99999", None).is_err());
    }

    #[test]
    fn test_dial_string_brackets_ipv6() {
        let loc = NetLocation::new(Address::Ipv6("::1".parse().unwrap()), 80);
        assert_eq!(loc.to_dial_string(), "[::1]:80");
    }
}
