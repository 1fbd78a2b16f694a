//! `_minecraft._tcp` SRV lookup using raw UDP packets.
//!
//! A server reachable as `play.example.net` may really listen on another host
//! and port, published as an SRV record. Only the default port triggers a
//! lookup, matching what the game client does when no port is typed.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;

use super::ProbeError;

pub const DEFAULT_PORT: u16 = 25565;
const RESOLV_CONF: &str = "/etc/resolv.conf";
const QTYPE_SRV: u16 = 33;
const QCLASS_IN: u16 = 1;
const HEADER_LEN: usize = 12;
const MAX_POINTER_JUMPS: usize = 16;

/// One SRV answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub priority: u16,
    pub weight: u16,
    pub port: u16,
    pub target: String,
}

/// Host and port to connect to for `host:port`. Falls back to the configured
/// address whenever there is no usable SRV record.
pub async fn resolve_endpoint(host: &str, port: u16, timeout: Duration) -> (String, u16) {
    if port != DEFAULT_PORT || host.parse::<IpAddr>().is_ok() {
        return (host.to_string(), port);
    }
    let Some(nameserver) = system_nameserver() else {
        return (host.to_string(), port);
    };

    match tokio::time::timeout(timeout, lookup_srv(nameserver, &service_name(host))).await {
        Ok(Ok(Some(record))) => {
            tracing::debug!("SRV for {}: {}:{}", host, record.target, record.port);
            (record.target, record.port)
        }
        Ok(Ok(None)) => (host.to_string(), port),
        Ok(Err(e)) => {
            tracing::debug!("SRV lookup for {} failed: {}", host, e);
            (host.to_string(), port)
        }
        Err(_) => {
            tracing::debug!("SRV lookup for {} timed out", host);
            (host.to_string(), port)
        }
    }
}

pub fn service_name(host: &str) -> String {
    format!("_minecraft._tcp.{}", host.trim_end_matches('.'))
}

fn system_nameserver() -> Option<SocketAddr> {
    let text = std::fs::read_to_string(RESOLV_CONF).ok()?;
    parse_nameserver(&text)
}

/// First `nameserver` line of a resolv.conf.
pub fn parse_nameserver(text: &str) -> Option<SocketAddr> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| line.strip_prefix("nameserver"))
        .filter_map(|rest| rest.trim().parse::<IpAddr>().ok())
        .map(|ip| SocketAddr::new(ip, 53))
        .next()
}

/// Ask `nameserver` for the SRV records of `name` and pick the preferred one.
pub async fn lookup_srv(nameserver: SocketAddr, name: &str) -> Result<Option<SrvRecord>, ProbeError> {
    let packet = build_srv_query(name)?;
    let tx_id = u16::from_be_bytes([packet[0], packet[1]]);

    let bind: SocketAddr = if nameserver.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(nameserver).await?;
    socket.send(&packet).await?;

    let mut response = [0u8; 1500];
    let n = socket.recv(&mut response).await?;

    Ok(preferred(parse_srv_response(&response[..n], tx_id)?))
}

/// Build a recursive query for the SRV records of `name`.
pub fn build_srv_query(name: &str) -> Result<Vec<u8>, ProbeError> {
    let tx_id: u16 = rand::random();
    let flags: u16 = 0x0100; // Standard query, recursion desired

    let mut packet = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(&[0; 6]);

    for label in name.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ProbeError::Malformed(format!("invalid DNS name: {}", name)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&QTYPE_SRV.to_be_bytes());
    packet.extend_from_slice(&QCLASS_IN.to_be_bytes());
    Ok(packet)
}

/// Extract the SRV answers from a response to the query `tx_id`.
pub fn parse_srv_response(packet: &[u8], tx_id: u16) -> Result<Vec<SrvRecord>, ProbeError> {
    if packet.len() < HEADER_LEN {
        return Err(ProbeError::Malformed(format!("DNS response too short: {} bytes", packet.len())));
    }

    let resp_tx_id = read_u16(packet, 0)?;
    if resp_tx_id != tx_id {
        return Err(ProbeError::Malformed(format!(
            "transaction ID mismatch: got {}, expected {}",
            resp_tx_id, tx_id
        )));
    }

    // NXDOMAIN just means there is no record
    match packet[3] & 0x0F {
        0 | 3 => {}
        rcode => return Err(ProbeError::Network(format!("DNS error RCODE: {}", rcode))),
    }

    let qd_count = read_u16(packet, 4)?;
    let an_count = read_u16(packet, 6)?;

    let mut offset = HEADER_LEN;
    for _ in 0..qd_count {
        offset = skip_name(packet, offset)? + 4;
    }

    let mut records = Vec::new();
    for _ in 0..an_count {
        offset = skip_name(packet, offset)?;
        let rtype = read_u16(packet, offset)?;
        let rd_len = read_u16(packet, offset + 8)? as usize;
        let rdata = offset + 10;
        if rdata + rd_len > packet.len() {
            return Err(ProbeError::Malformed("truncated DNS answer".to_string()));
        }

        if rtype == QTYPE_SRV && rd_len >= 7 {
            let (target, _) = read_name(packet, rdata + 6)?;
            records.push(SrvRecord {
                priority: read_u16(packet, rdata)?,
                weight: read_u16(packet, rdata + 2)?,
                port: read_u16(packet, rdata + 4)?,
                target,
            });
        }
        offset = rdata + rd_len;
    }

    Ok(records)
}

/// Lowest priority wins, then highest weight. A target of "." means the
/// service is explicitly unavailable.
pub fn preferred(records: Vec<SrvRecord>) -> Option<SrvRecord> {
    records
        .into_iter()
        .filter(|r| !r.target.is_empty())
        .min_by_key(|r| (r.priority, std::cmp::Reverse(r.weight)))
}

fn read_u16(packet: &[u8], offset: usize) -> Result<u16, ProbeError> {
    packet
        .get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| ProbeError::Malformed("truncated DNS packet".to_string()))
}

fn label_len(packet: &[u8], offset: usize) -> Result<u8, ProbeError> {
    packet
        .get(offset)
        .copied()
        .ok_or_else(|| ProbeError::Malformed("truncated DNS name".to_string()))
}

/// Offset just past the name starting at `offset`.
fn skip_name(packet: &[u8], mut offset: usize) -> Result<usize, ProbeError> {
    loop {
        let len = label_len(packet, offset)?;
        match len {
            0 => return Ok(offset + 1),
            l if l & 0xC0 == 0xC0 => return Ok(offset + 2),
            l => offset += 1 + l as usize,
        }
    }
}

/// Decode a possibly compressed name. Returns the dotted name without the
/// root label and the offset just past it.
fn read_name(packet: &[u8], start: usize) -> Result<(String, usize), ProbeError> {
    let mut labels: Vec<String> = Vec::new();
    let mut offset = start;
    let mut end = None;
    let mut jumps = 0;

    loop {
        let len = label_len(packet, offset)?;
        if len == 0 {
            let end = end.unwrap_or(offset + 1);
            return Ok((labels.join("."), end));
        }
        if len & 0xC0 == 0xC0 {
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return Err(ProbeError::Malformed("DNS name pointer loop".to_string()));
            }
            let pointer = (read_u16(packet, offset)? & 0x3FFF) as usize;
            end.get_or_insert(offset + 2);
            offset = pointer;
            continue;
        }

        let label = packet
            .get(offset + 1..offset + 1 + len as usize)
            .ok_or_else(|| ProbeError::Malformed("truncated DNS label".to_string()))?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        offset += 1 + len as usize;
    }
}
