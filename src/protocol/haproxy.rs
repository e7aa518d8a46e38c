//! HAProxy PROXY protocol preamble parsing.
//!
//! When a listener runs behind HAProxy, the first bytes of every inbound
//! connection carry the original client and server addresses in either the
//! v1 text format (`PROXY TCP4 ...\r\n`) or the v2 binary format. The
//! preamble is consumed before normal framing begins; any bytes after it in
//! the same recv belong to the framing layer.
//!
//! Reference: <https://www.haproxy.org/download/1.8/doc/proxy-protocol.txt>

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;

/// v2 signature: `\r\n\r\n\0\r\nQUIT\n`.
pub const V2_SIGNATURE: [u8; 12] = [
    0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
];

/// Longest possible v1 header, terminator included.
pub const V1_HEADER_MAX: usize = 107;
/// Shortest possible v1 header (`PROXY UNKNOWN\r\n` is 15; the fixed prefix
/// alone is 8, which is enough to classify).
const V1_PREFIX: &[u8] = b"PROXY ";
/// Fixed portion of a v2 header: signature + version/command + family + length.
pub const V2_HEADER_MIN: usize = 16;

const V2_CMD_LOCAL: u8 = 0x00;
const V2_CMD_PROXY: u8 = 0x01;
const V2_FAMILY_TCP4: u8 = 0x11;
const V2_FAMILY_TCP6: u8 = 0x21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PreambleError {
    /// First bytes match neither v1 text nor the v2 signature.
    #[error("connection does not begin with a PROXY preamble")]
    NotProxy,
    /// Header is structurally invalid.
    #[error("malformed PROXY header")]
    Malformed,
    /// Transport family this router does not accept.
    #[error("unsupported PROXY address family")]
    UnsupportedFamily,
}

/// Parsed preamble.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyPreamble {
    /// Original client address, when the family carries one.
    pub remote: Option<SocketAddr>,
    /// Original server-side address, when the family carries one.
    pub local: Option<SocketAddr>,
    /// Raw v2 TLV bytes, preserved opaquely.
    pub tlvs: Vec<u8>,
    /// Health-check connection from the proxy itself (v2 LOCAL command or
    /// v1 UNKNOWN family). Carries no peer addresses.
    pub is_local: bool,
}

/// Outcome of a parse attempt over the bytes accumulated so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreambleStatus {
    /// Prefix is consistent with a preamble but incomplete; read more.
    NeedMore,
    /// Preamble fully parsed; `consumed` bytes belong to it, the rest is
    /// application data.
    Done {
        preamble: ProxyPreamble,
        consumed: usize,
    },
}

/// Parse the PROXY preamble out of the front of `buf`.
///
/// `buf` must contain everything received on the connection so far, starting
/// at byte zero. The caller keeps accumulating on `NeedMore` and disconnects
/// with a protocol error on `Err`.
pub fn parse_preamble(buf: &[u8]) -> Result<PreambleStatus, PreambleError> {
    if buf.is_empty() {
        return Ok(PreambleStatus::NeedMore);
    }

    // Classify by first byte: v2 signature starts with 0x0D, v1 with 'P'.
    match buf[0] {
        0x0d => parse_v2(buf),
        b'P' => parse_v1(buf),
        _ => Err(PreambleError::NotProxy),
    }
}

fn parse_v1(buf: &[u8]) -> Result<PreambleStatus, PreambleError> {
    let prefix_len = buf.len().min(V1_PREFIX.len());
    if buf[..prefix_len] != V1_PREFIX[..prefix_len] {
        return Err(PreambleError::NotProxy);
    }
    if buf.len() < V1_PREFIX.len() {
        return Ok(PreambleStatus::NeedMore);
    }

    let window = &buf[..buf.len().min(V1_HEADER_MAX)];
    let Some(cr) = window.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() >= V1_HEADER_MAX {
            // Terminator must appear within the documented maximum.
            return Err(PreambleError::Malformed);
        }
        return Ok(PreambleStatus::NeedMore);
    };

    let line = std::str::from_utf8(&buf[..cr]).map_err(|_| PreambleError::Malformed)?;
    let consumed = cr + 2;
    let mut fields = line.split(' ');
    // First token is "PROXY", already verified byte-wise.
    fields.next();

    let family = fields.next().ok_or(PreambleError::Malformed)?;
    match family {
        "UNKNOWN" => {
            // Anything up to the terminator is permitted and ignored.
            Ok(PreambleStatus::Done {
                preamble: ProxyPreamble {
                    is_local: true,
                    ..Default::default()
                },
                consumed,
            })
        }
        "TCP4" | "TCP6" => {
            let src_ip = fields.next().ok_or(PreambleError::Malformed)?;
            let dst_ip = fields.next().ok_or(PreambleError::Malformed)?;
            let src_port = fields.next().ok_or(PreambleError::Malformed)?;
            let dst_port = fields.next().ok_or(PreambleError::Malformed)?;
            if fields.next().is_some() {
                return Err(PreambleError::Malformed);
            }

            let remote = parse_v1_addr(family, src_ip, src_port)?;
            let local = parse_v1_addr(family, dst_ip, dst_port)?;
            Ok(PreambleStatus::Done {
                preamble: ProxyPreamble {
                    remote: Some(remote),
                    local: Some(local),
                    tlvs: Vec::new(),
                    is_local: false,
                },
                consumed,
            })
        }
        _ => Err(PreambleError::UnsupportedFamily),
    }
}

fn parse_v1_addr(family: &str, ip: &str, port: &str) -> Result<SocketAddr, PreambleError> {
    let port: u16 = port.parse().map_err(|_| PreambleError::Malformed)?;
    let ip: IpAddr = ip.parse().map_err(|_| PreambleError::Malformed)?;
    // The family token must agree with the address notation.
    match (family, &ip) {
        ("TCP4", IpAddr::V4(_)) | ("TCP6", IpAddr::V6(_)) => Ok(SocketAddr::new(ip, port)),
        _ => Err(PreambleError::Malformed),
    }
}

fn parse_v2(buf: &[u8]) -> Result<PreambleStatus, PreambleError> {
    let sig_len = buf.len().min(V2_SIGNATURE.len());
    if buf[..sig_len] != V2_SIGNATURE[..sig_len] {
        return Err(PreambleError::NotProxy);
    }
    if buf.len() < V2_HEADER_MIN {
        return Ok(PreambleStatus::NeedMore);
    }

    let ver_cmd = buf[12];
    if ver_cmd >> 4 != 0x2 {
        return Err(PreambleError::Malformed);
    }
    let command = ver_cmd & 0x0f;
    let family = buf[13];
    // Address block length is network byte order.
    let addr_len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    let total = V2_HEADER_MIN + addr_len;
    if buf.len() < total {
        return Ok(PreambleStatus::NeedMore);
    }
    let addr_block = &buf[V2_HEADER_MIN..total];

    match command {
        V2_CMD_LOCAL => {
            // Health probe: address block (if any) is ignored.
            Ok(PreambleStatus::Done {
                preamble: ProxyPreamble {
                    is_local: true,
                    ..Default::default()
                },
                consumed: total,
            })
        }
        V2_CMD_PROXY => {
            let (remote, local, tlvs) = match family {
                V2_FAMILY_TCP4 => {
                    if addr_block.len() < 12 {
                        return Err(PreambleError::Malformed);
                    }
                    let src = Ipv4Addr::new(
                        addr_block[0],
                        addr_block[1],
                        addr_block[2],
                        addr_block[3],
                    );
                    let dst = Ipv4Addr::new(
                        addr_block[4],
                        addr_block[5],
                        addr_block[6],
                        addr_block[7],
                    );
                    let src_port = u16::from_be_bytes([addr_block[8], addr_block[9]]);
                    let dst_port = u16::from_be_bytes([addr_block[10], addr_block[11]]);
                    (
                        SocketAddr::new(IpAddr::V4(src), src_port),
                        SocketAddr::new(IpAddr::V4(dst), dst_port),
                        addr_block[12..].to_vec(),
                    )
                }
                V2_FAMILY_TCP6 => {
                    if addr_block.len() < 36 {
                        return Err(PreambleError::Malformed);
                    }
                    let mut src = [0u8; 16];
                    let mut dst = [0u8; 16];
                    src.copy_from_slice(&addr_block[0..16]);
                    dst.copy_from_slice(&addr_block[16..32]);
                    let src_port = u16::from_be_bytes([addr_block[32], addr_block[33]]);
                    let dst_port = u16::from_be_bytes([addr_block[34], addr_block[35]]);
                    (
                        SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), src_port),
                        SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dst_port),
                        addr_block[36..].to_vec(),
                    )
                }
                _ => return Err(PreambleError::UnsupportedFamily),
            };
            Ok(PreambleStatus::Done {
                preamble: ProxyPreamble {
                    remote: Some(remote),
                    local: Some(local),
                    tlvs,
                    is_local: false,
                },
                consumed: total,
            })
        }
        _ => Err(PreambleError::Malformed),
    }
}
