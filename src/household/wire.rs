//! Household wire formats
//!
//! Traffic packets are binary WebSocket frames with a fixed little-endian
//! header; control messages are JSON text frames on the same socket. The
//! payload of every traffic packet is filled with the user's four-byte
//! marker so server-side logs stay auditable.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Bytes in the fixed packet header:
/// `u32 seq | u32 ts_ms_lo | u8 direction_flag | u8 payload_type | u16 size`
pub const HEADER_LEN: usize = 12;

/// Per-user payload markers
pub mod marker {
    /// Gaming traffic (alex)
    pub const GAMER: &[u8; 4] = b"GAME";
    /// Video-call traffic (sarah)
    pub const VIDEO: &[u8; 4] = b"VIDE";
    /// Streaming traffic (jake)
    pub const STREAMER: &[u8; 4] = b"NFLX";
    /// Bulk traffic (computer)
    pub const BULK: &[u8; 4] = b"DATA";
}

/// Direction flag carried in the packet header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketDirection {
    /// Client-to-server
    Upload = 0,
    /// Server-to-client
    Download = 1,
}

impl PacketDirection {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PacketDirection::Upload),
            1 => Ok(PacketDirection::Download),
            other => Err(Error::Other(format!("invalid direction flag: {other}"))),
        }
    }
}

/// Frame kind carried in the packet header
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadKind {
    /// Plain data (gaming, streaming, bulk)
    Data = 0,
    /// Video I-frame (one per GOP)
    IFrame = 1,
    /// Video P-frame
    PFrame = 2,
    /// Video B-frame
    BFrame = 3,
}

impl PayloadKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PayloadKind::Data),
            1 => Ok(PayloadKind::IFrame),
            2 => Ok(PayloadKind::PFrame),
            3 => Ok(PayloadKind::BFrame),
            other => Err(Error::Other(format!("invalid payload type: {other}"))),
        }
    }
}

/// Decoded fixed header of a traffic packet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PacketHeader {
    /// Per-socket sequence number
    pub seq: u32,
    /// Low 32 bits of the sender's monotonic millisecond clock
    pub ts_ms_lo: u32,
    /// Who put the packet on the wire
    pub direction: PacketDirection,
    /// Frame kind
    pub payload_kind: PayloadKind,
    /// Payload bytes following the header
    pub size: u16,
}

/// Encode a traffic packet: header plus a payload of `size` bytes filled
/// with the repeating four-byte marker
pub fn encode_packet(header: &PacketHeader, marker: &[u8; 4]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + header.size as usize);
    frame.extend_from_slice(&header.seq.to_le_bytes());
    frame.extend_from_slice(&header.ts_ms_lo.to_le_bytes());
    frame.push(header.direction as u8);
    frame.push(header.payload_kind as u8);
    frame.extend_from_slice(&header.size.to_le_bytes());

    for i in 0..header.size as usize {
        frame.push(marker[i % 4]);
    }
    frame
}

/// Decode the fixed header from an incoming binary frame
pub fn decode_header(frame: &[u8]) -> Result<PacketHeader> {
    if frame.len() < HEADER_LEN {
        return Err(Error::Other(format!(
            "binary frame too short: {} bytes, need {HEADER_LEN}",
            frame.len()
        )));
    }

    // Indexing is safe after the length check above
    let seq = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
    let ts_ms_lo = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
    let direction = PacketDirection::from_u8(frame[8])?;
    let payload_kind = PayloadKind::from_u8(frame[9])?;
    let size = u16::from_le_bytes([frame[10], frame[11]]);

    Ok(PacketHeader {
        seq,
        ts_ms_lo,
        direction,
        payload_kind,
        size,
    })
}

/// JSON control messages exchanged as text frames
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client asks the server to start generating this user's traffic
    StartTraffic {
        /// User the traffic belongs to
        user_id: String,
        /// Activity label ("gaming", "video-call", ...)
        activity: String,
        /// Nominal packet size in bytes
        packet_size: u32,
        /// Send interval in milliseconds
        interval_ms: u64,
        /// Upload share of the traffic split, in [0, 1]
        upload_ratio: f64,
        /// DSCP tag for server-side classification
        dscp: String,
    },

    /// Client asks the server to stop generating traffic
    StopTraffic {
        /// User the traffic belongs to
        user_id: String,
    },

    /// Latency probe carrying a monotonic millisecond timestamp
    Ping {
        /// Sender's monotonic clock in milliseconds
        timestamp: u64,
        /// Probe sequence number
        sequence: u32,
    },

    /// Reply to a ping, echoing its timestamp
    Pong {
        /// The timestamp from the ping being answered
        timestamp: u64,
        /// Responder's own clock, when available
        #[serde(skip_serializing_if = "Option::is_none")]
        server_timestamp: Option<u64>,
        /// The sequence from the ping being answered
        sequence: u32,
    },

    /// Client asks for download traffic at a target rate
    RequestDownload {
        /// User the traffic belongs to
        user_id: String,
        /// Requested download rate in bits per second
        throughput_bps: u64,
        /// Requested burst duration in milliseconds
        duration_ms: u64,
    },

    /// Server-initiated ask for an echo burst from the client
    DownloadRequest {
        /// Requested echo size in bytes
        #[serde(default)]
        size: u32,
    },

    /// Acknowledgement of a download request
    DownloadResponse {
        /// Size honored, in bytes
        size: u32,
    },

    /// Server confirms traffic generation started
    TrafficStarted {
        /// User the confirmation is for
        user_id: String,
    },

    /// Server confirms traffic generation stopped
    TrafficStopped {
        /// User the confirmation is for
        user_id: String,
    },

    /// Socket round-trip check before traffic starts
    ConnectionTest {
        /// Sender's monotonic clock in milliseconds
        timestamp: u64,
    },

    /// Reply to a connection test
    ConnectionTestResponse {
        /// The timestamp from the test being answered
        timestamp: u64,
    },

    /// Server-side error surfaced on the socket
    Error {
        /// Human-readable cause
        message: String,
    },
}

/// HTTP reply a household user endpoint may return instead of upgrading:
/// the client must then dial `websocket_url`
#[derive(Clone, Debug, Deserialize)]
pub struct RedirectResponse {
    /// True when the client must dial elsewhere
    pub redirect: bool,
    /// The WebSocket URL to dial
    pub websocket_url: String,
    /// Advertised port of the dedicated process
    #[serde(default)]
    pub port: Option<u16>,
    /// Server architecture tag, informational
    #[serde(default)]
    pub architecture: Option<String>,
    /// Whether the server isolates users in dedicated processes
    #[serde(default)]
    pub process_isolation: Option<bool>,
}
