use anyhow::{anyhow, bail, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

const V2_SIGNATURE: [u8; 12] =
    [0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a];
const V1_MAX_LINE: usize = 107;

/// Peer address information recovered from a PROXY protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyInfo {
    /// Original client address; None for LOCAL/UNKNOWN connections.
    pub source: Option<SocketAddr>,
}

/// Consume a PROXY protocol v1 or v2 header from the start of the
/// stream. Must be called before any other byte is read; a malformed
/// header is fatal for the connection.
pub async fn read_proxy_header<R>(reader: &mut R) -> Result<ProxyInfo>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 6];
    reader.read_exact(&mut head).await?;

    if &head == b"PROXY " {
        return read_v1(reader).await;
    }

    let mut rest = [0u8; 6];
    reader.read_exact(&mut rest).await?;
    let mut signature = [0u8; 12];
    signature[..6].copy_from_slice(&head);
    signature[6..].copy_from_slice(&rest);
    if signature != V2_SIGNATURE {
        bail!("malformed PROXY protocol header");
    }
    read_v2(reader).await
}

async fn read_v1<R>(reader: &mut R) -> Result<ProxyInfo>
where
    R: AsyncRead + Unpin,
{
    // Remainder of "PROXY <proto> <src> <dst> <sport> <dport>\r\n"
    let mut line = Vec::with_capacity(64);
    loop {
        let byte = reader.read_u8().await?;
        line.push(byte);
        if byte == b'\n' {
            break;
        }
        if line.len() > V1_MAX_LINE {
            bail!("PROXY v1 header too long");
        }
    }
    if !line.ends_with(b"\r\n") {
        bail!("PROXY v1 header missing CRLF");
    }
    let text = std::str::from_utf8(&line[..line.len() - 2])
        .map_err(|_| anyhow!("PROXY v1 header is not ASCII"))?;
    let mut fields = text.split(' ');

    match fields.next() {
        Some("TCP4") | Some("TCP6") => {}
        Some("UNKNOWN") => return Ok(ProxyInfo { source: None }),
        _ => bail!("unsupported PROXY v1 protocol"),
    }

    let src_ip: IpAddr = fields
        .next()
        .ok_or_else(|| anyhow!("PROXY v1 missing source address"))?
        .parse()?;
    let _dst_ip: IpAddr = fields
        .next()
        .ok_or_else(|| anyhow!("PROXY v1 missing destination address"))?
        .parse()?;
    let src_port: u16 = fields
        .next()
        .ok_or_else(|| anyhow!("PROXY v1 missing source port"))?
        .parse()?;
    let _dst_port: u16 = fields
        .next()
        .ok_or_else(|| anyhow!("PROXY v1 missing destination port"))?
        .parse()?;
    if fields.next().is_some() {
        bail!("trailing fields in PROXY v1 header");
    }

    Ok(ProxyInfo { source: Some(SocketAddr::new(src_ip, src_port)) })
}

async fn read_v2<R>(reader: &mut R) -> Result<ProxyInfo>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    reader.read_exact(&mut head).await?;
    let [ver_cmd, family, len_hi, len_lo] = head;
    if ver_cmd >> 4 != 0x2 {
        bail!("unsupported PROXY v2 version");
    }
    let command = ver_cmd & 0x0f;
    let len = u16::from_be_bytes([len_hi, len_lo]) as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    // LOCAL: health checks and the like, no address rewrite.
    if command == 0x0 {
        return Ok(ProxyInfo { source: None });
    }
    if command != 0x1 {
        bail!("unsupported PROXY v2 command");
    }

    match family >> 4 {
        // AF_INET, stream or dgram
        0x1 => {
            if payload.len() < 12 {
                bail!("short PROXY v2 IPv4 payload");
            }
            let src = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
            let src_port = u16::from_be_bytes([payload[8], payload[9]]);
            Ok(ProxyInfo { source: Some(SocketAddr::new(IpAddr::V4(src), src_port)) })
        }
        // AF_INET6
        0x2 => {
            if payload.len() < 36 {
                bail!("short PROXY v2 IPv6 payload");
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&payload[0..16]);
            let src = Ipv6Addr::from(octets);
            let src_port = u16::from_be_bytes([payload[32], payload[33]]);
            Ok(ProxyInfo { source: Some(SocketAddr::new(IpAddr::V6(src), src_port)) })
        }
        // AF_UNSPEC / AF_UNIX
        _ => Ok(ProxyInfo { source: None }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_v1_tcp4() {
        let mut input = Cursor::new(b"PROXY TCP4 192.0.2.1 198.51.100.2 56324 143\r\n".to_vec());
        let info = read_proxy_header(&mut input).await.unwrap();
        assert_eq!(info.source, Some("192.0.2.1:56324".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_v1_unknown() {
        let mut input = Cursor::new(b"PROXY UNKNOWN\r\n".to_vec());
        let info = read_proxy_header(&mut input).await.unwrap();
        assert_eq!(info.source, None);
    }

    #[tokio::test]
    async fn test_v1_malformed_is_fatal() {
        let mut input = Cursor::new(b"PROXY TCP4 not-an-ip x 1 2\r\n".to_vec());
        assert!(read_proxy_header(&mut input).await.is_err());

        let mut input = Cursor::new(b"GARBAGE BYTES HERE\r\n...padding....".to_vec());
        assert!(read_proxy_header(&mut input).await.is_err());
    }

    #[tokio::test]
    async fn test_v2_ipv4() {
        let mut bytes = V2_SIGNATURE.to_vec();
        bytes.push(0x21); // version 2, PROXY command
        bytes.push(0x11); // AF_INET, SOCK_STREAM
        bytes.extend_from_slice(&12u16.to_be_bytes());
        bytes.extend_from_slice(&[192, 0, 2, 7]); // src
        bytes.extend_from_slice(&[203, 0, 113, 9]); // dst
        bytes.extend_from_slice(&9999u16.to_be_bytes()); // src port
        bytes.extend_from_slice(&143u16.to_be_bytes()); // dst port
        let mut input = Cursor::new(bytes);
        let info = read_proxy_header(&mut input).await.unwrap();
        assert_eq!(info.source, Some("192.0.2.7:9999".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_v2_local_command() {
        let mut bytes = V2_SIGNATURE.to_vec();
        bytes.push(0x20); // version 2, LOCAL
        bytes.push(0x00);
        bytes.extend_from_slice(&0u16.to_be_bytes());
        let mut input = Cursor::new(bytes);
        let info = read_proxy_header(&mut input).await.unwrap();
        assert_eq!(info.source, None);
    }
}
