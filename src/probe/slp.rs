//! Server List Ping: the status handshake spoken by Minecraft Java servers.
//!
//! Every packet is `VarInt(length) ++ VarInt(packet id) ++ body`.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::srv::resolve_endpoint;
use super::{OnlineStatus, ProbeError};

/// "Any version" - servers answer status requests regardless.
const PROTOCOL_VERSION_ANY: i32 = -1;
const NEXT_STATE_STATUS: i32 = 1;
const PACKET_STATUS: u32 = 0x00;
const PACKET_PING: u32 = 0x01;
const MAX_PACKET_LEN: usize = 1 << 20;

#[derive(Debug, Deserialize)]
struct StatusResponse {
    version: VersionInfo,
    players: PlayersInfo,
    #[serde(default)]
    description: Value,
}

#[derive(Debug, Deserialize)]
struct VersionInfo {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PlayersInfo {
    online: u32,
    max: u32,
}

/// Query a server's status, bounded by `timeout` end to end.
pub async fn query_status(host: &str, port: u16, timeout: Duration) -> Result<OnlineStatus, ProbeError> {
    tokio::time::timeout(timeout, exchange(host, port, timeout))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
}

async fn exchange(host: &str, port: u16, timeout: Duration) -> Result<OnlineStatus, ProbeError> {
    let (connect_host, connect_port) = resolve_endpoint(host, port, timeout / 2).await;
    let mut stream = TcpStream::connect((connect_host.as_str(), connect_port)).await?;
    stream.set_nodelay(true)?;

    let mut request = build_handshake(host, port);
    request.extend_from_slice(&build_status_request());
    stream.write_all(&request).await?;

    let (id, body) = read_packet(&mut stream).await?;
    if id != PACKET_STATUS {
        return Err(ProbeError::Malformed(format!(
            "expected status response, got packet 0x{:02x}",
            id
        )));
    }
    let json = read_string(&body)?;
    let response: StatusResponse = serde_json::from_str(&json)
        .map_err(|e| ProbeError::Malformed(format!("invalid status JSON: {}", e)))?;

    let token: i64 = rand::random();
    let start = Instant::now();
    stream.write_all(&build_ping(token)).await?;
    let (id, body) = read_packet(&mut stream).await?;
    let ping_ms = start.elapsed().as_millis() as u64;

    if id != PACKET_PING {
        return Err(ProbeError::Malformed(format!("expected pong, got packet 0x{:02x}", id)));
    }
    if body[..] != token.to_be_bytes()[..] {
        return Err(ProbeError::Malformed("pong payload mismatch".to_string()));
    }

    Ok(OnlineStatus {
        players: response.players.online,
        max_players: response.players.max,
        version: response.version.name,
        motd: clean_motd(&response.description),
        ping_ms,
    })
}

fn write_varint(value: i32, out: &mut Vec<u8>) {
    // Negative values are sent as their two's complement, i.e. five bytes
    let mut buf = unsigned_varint::encode::u32_buffer();
    out.extend_from_slice(unsigned_varint::encode::u32(value as u32, &mut buf));
}

fn write_string(value: &str, out: &mut Vec<u8>) {
    write_varint(value.len() as i32, out);
    out.extend_from_slice(value.as_bytes());
}

/// Prefix a packet id and body with the frame length.
fn frame(packet_id: u32, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(body.len() + 5);
    write_varint(packet_id as i32, &mut payload);
    payload.extend_from_slice(body);

    let mut packet = Vec::with_capacity(payload.len() + 5);
    write_varint(payload.len() as i32, &mut packet);
    packet.extend_from_slice(&payload);
    packet
}

/// Build the handshake announcing a status query.
pub fn build_handshake(host: &str, port: u16) -> Vec<u8> {
    let mut body = Vec::with_capacity(host.len() + 16);
    write_varint(PROTOCOL_VERSION_ANY, &mut body);
    write_string(host, &mut body);
    body.extend_from_slice(&port.to_be_bytes());
    write_varint(NEXT_STATE_STATUS, &mut body);
    frame(PACKET_STATUS, &body)
}

pub fn build_status_request() -> Vec<u8> {
    frame(PACKET_STATUS, &[])
}

pub fn build_ping(token: i64) -> Vec<u8> {
    frame(PACKET_PING, &token.to_be_bytes())
}

async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u32, ProbeError> {
    let mut buf = [0u8; 5];
    for i in 0..buf.len() {
        buf[i] = reader.read_u8().await?;
        if unsigned_varint::decode::is_last(buf[i]) {
            let (value, _) = unsigned_varint::decode::u32(&buf[..=i])
                .map_err(|e| ProbeError::Malformed(format!("bad varint: {}", e)))?;
            return Ok(value);
        }
    }
    Err(ProbeError::Malformed("varint longer than 5 bytes".to_string()))
}

/// Read one frame and split it into packet id and body.
async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(u32, Vec<u8>), ProbeError> {
    let len = read_varint(reader).await? as usize;
    if len == 0 || len > MAX_PACKET_LEN {
        return Err(ProbeError::Malformed(format!("invalid packet length {}", len)));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;

    let (id, rest) = unsigned_varint::decode::u32(&data)
        .map_err(|e| ProbeError::Malformed(format!("bad packet id: {}", e)))?;
    Ok((id, rest.to_vec()))
}

fn read_string(body: &[u8]) -> Result<String, ProbeError> {
    let (len, rest) = unsigned_varint::decode::u32(body)
        .map_err(|e| ProbeError::Malformed(format!("bad string length: {}", e)))?;
    let bytes = rest
        .get(..len as usize)
        .ok_or_else(|| ProbeError::Malformed("string runs past end of packet".to_string()))?;
    String::from_utf8(bytes.to_vec()).map_err(|_| ProbeError::Malformed("string is not UTF-8".to_string()))
}

fn format_codes() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"§[0-9a-fk-orxA-FK-ORX]?").expect("valid regex"))
}

/// Flatten a description (plain string or chat component) to plain text.
pub fn clean_motd(description: &Value) -> String {
    let mut text = String::new();
    flatten_component(description, &mut text);
    format_codes().replace_all(&text, "").trim().to_string()
}

fn flatten_component(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Array(parts) => parts.iter().for_each(|p| flatten_component(p, out)),
        Value::Object(obj) => {
            if let Some(text) = obj.get("text") {
                flatten_component(text, out);
            }
            if let Some(extra) = obj.get("extra") {
                flatten_component(extra, out);
            }
        }
        _ => {}
    }
}
