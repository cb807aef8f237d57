//! Wire format of the gesture sensor's GATT service.
//!
//! The sensor exposes one service with three characteristics:
//!
//! - **Command** (write, notify): a single byte, see [`Command`].
//! - **Acceleration Data** (notify): `<seq u8> <count u8> <count × sample>`,
//!   where each sample is three little-endian `i16` values (x, y, z) in milli-g.
//! - **Status** (notify): a single byte, see [`Status`].
//!
//! Everything here is pure. Decoding never panics on short input: a truncated
//! acceleration payload yields the complete samples that are present.

use serde::{Deserialize, Serialize};

use crate::errors::MalformedNotification;

// ============================================================================
// Constants
// ============================================================================

pub const SERVICE_UUID: &str = "19b10000-e8f2-537e-4f6c-d104768a1214";
pub const COMMAND_UUID: &str = "19b10001-e8f2-537e-4f6c-d104768a1214";
pub const ACCEL_DATA_UUID: &str = "19b10002-e8f2-537e-4f6c-d104768a1214";
pub const STATUS_UUID: &str = "19b10003-e8f2-537e-4f6c-d104768a1214";

/// Advertised name prefix of the sensor board.
pub const DEFAULT_DEVICE_NAME: &str = "Nano33IoT";

/// `<seq> <count>`
pub const CHUNK_HEADER_LEN: usize = 2;
/// Three `i16` axes.
pub const BYTES_PER_SAMPLE: usize = 6;
pub const MILLI_G_PER_G: f64 = 1000.0;

/// Chunks the sketch sends for one gesture (3 samples each, ~125 samples total).
pub const EXPECTED_CHUNKS: usize = 42;
pub const SAMPLES_PER_CHUNK: usize = 3;

// ============================================================================
// Characteristics
// ============================================================================

/// GATT characteristics used by the capture protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Characteristic {
    Command,
    AccelData,
    Status,
}

impl Characteristic {
    pub const ALL: [Characteristic; 3] = [
        Characteristic::Command,
        Characteristic::AccelData,
        Characteristic::Status,
    ];

    pub fn uuid(self) -> &'static str {
        match self {
            Characteristic::Command => COMMAND_UUID,
            Characteristic::AccelData => ACCEL_DATA_UUID,
            Characteristic::Status => STATUS_UUID,
        }
    }

    /// Look up a characteristic by UUID string, ignoring case.
    pub fn from_uuid(uuid: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|c| c.uuid().eq_ignore_ascii_case(uuid))
    }
}

/// True if `uuid` names the capture service.
pub fn is_capture_service(uuid: &str) -> bool {
    SERVICE_UUID.eq_ignore_ascii_case(uuid)
}

// ============================================================================
// Command / Status codes
// ============================================================================

/// Values of the command characteristic.
///
/// Only `StartCapture` is ever written by the host; `Busy` and `Idle` are
/// reported back by the sketch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Idle = 0,
    StartCapture = 1,
    Busy = 2,
}

impl Command {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Command::Idle),
            1 => Some(Command::StartCapture),
            2 => Some(Command::Busy),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Values of the status characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ready = 0,
    Countdown3 = 1,
    Countdown2 = 2,
    Countdown1 = 3,
    Capturing = 4,
    Complete = 5,
    Error = 6,
}

impl Status {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0 => Some(Status::Ready),
            1 => Some(Status::Countdown3),
            2 => Some(Status::Countdown2),
            3 => Some(Status::Countdown1),
            4 => Some(Status::Capturing),
            5 => Some(Status::Complete),
            6 => Some(Status::Error),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Seconds left on the countdown, for the three countdown codes.
    pub fn countdown(self) -> Option<u8> {
        match self {
            Status::Countdown3 => Some(3),
            Status::Countdown2 => Some(2),
            Status::Countdown1 => Some(1),
            _ => None,
        }
    }
}

// ============================================================================
// Data Types
// ============================================================================

/// One accelerometer reading in g.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Sample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Sample {
    #[inline]
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// One acceleration notification: a sequence number and its samples.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Chunk {
    /// Position of this chunk within the capture (0-255, wraps).
    pub seq: u8,
    pub samples: Vec<Sample>,
}

// ============================================================================
// Codec
// ============================================================================

/// The byte written to the command characteristic to start a capture.
pub fn encode_start_command() -> [u8; 1] {
    [Command::StartCapture.as_byte()]
}

/// Decode a status notification. Only the first byte is significant.
pub fn decode_status(data: &[u8]) -> Result<Status, MalformedNotification> {
    let code = *data.first().ok_or(MalformedNotification::Empty)?;
    Status::from_byte(code).ok_or(MalformedNotification::UnknownStatus(code))
}

/// Decode a command notification (`Busy`/`Idle` reported by the sketch).
pub fn decode_command(data: &[u8]) -> Result<Command, MalformedNotification> {
    let code = *data.first().ok_or(MalformedNotification::Empty)?;
    Command::from_byte(code).ok_or(MalformedNotification::UnknownCommand(code))
}

/// Decode an acceleration notification.
///
/// Fails only when the header is incomplete. If the payload holds fewer than
/// the advertised sample count, the complete samples present are returned.
pub fn decode_accel_chunk(data: &[u8]) -> Result<Chunk, MalformedNotification> {
    if data.len() < CHUNK_HEADER_LEN {
        return Err(if data.is_empty() {
            MalformedNotification::Empty
        } else {
            MalformedNotification::TooShort { len: data.len() }
        });
    }

    let seq = data[0];
    let claimed = data[1] as usize;
    let payload = &data[CHUNK_HEADER_LEN..];

    let samples = payload
        .chunks_exact(BYTES_PER_SAMPLE)
        .take(claimed)
        .map(|raw| {
            let axis = |i: usize| i16::from_le_bytes([raw[i], raw[i + 1]]) as f64 / MILLI_G_PER_G;
            Sample::new(axis(0), axis(2), axis(4))
        })
        .collect();

    Ok(Chunk { seq, samples })
}

/// Encode an acceleration notification the way the sensor sketch does.
///
/// Values are rounded to the nearest milli-g and saturate at the `i16` range.
/// At most 255 samples are encoded.
pub fn encode_accel_chunk(seq: u8, samples: &[Sample]) -> Vec<u8> {
    let samples = &samples[..samples.len().min(u8::MAX as usize)];
    let mut out = Vec::with_capacity(CHUNK_HEADER_LEN + samples.len() * BYTES_PER_SAMPLE);
    out.push(seq);
    out.push(samples.len() as u8);
    for s in samples {
        for v in [s.x, s.y, s.z] {
            let mg = (v * MILLI_G_PER_G)
                .round()
                .clamp(i16::MIN as f64, i16::MAX as f64) as i16;
            out.extend_from_slice(&mg.to_le_bytes());
        }
    }
    out
}
