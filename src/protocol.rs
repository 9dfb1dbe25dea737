//! Coordinator/worker wire protocol.
//!
//! Messages travel over the worker's stdin/stdout as frames:
//! ```text
//! [version: 1 byte][length: 4 bytes LE][body: N bytes JSON][crc32: 4 bytes LE]
//! ```
//! Model handles never appear in a message; only the [`ModelRef`] does.

use std::io::{Error as IoError, ErrorKind, Read, Result as IoResult, Write};

use crc32fast::Hasher;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::model::ModelRef;
use crate::outcome::{Failure, ResultPolicy, SimulationValue};
use crate::platform::PlatformKey;
use crate::request::SimulationRequest;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest accepted frame body (64 MiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Coordinator to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum WorkerCommand {
    /// Sent once after spawn. The model is loaded on the first `Simulate`.
    Init {
        /// Model to load.
        model: ModelRef,
        /// Platform detected by the coordinator.
        platform: PlatformKey,
    },
    /// Run one request.
    Simulate {
        /// Batch index of the request.
        index: usize,
        /// The request.
        request: SimulationRequest,
        /// Distillation applied before replying.
        policy: ResultPolicy,
    },
    /// Exit the serve loop.
    Shutdown,
}

/// Worker to coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum WorkerReply {
    /// Result of a `Simulate` command.
    Outcome {
        /// Batch index of the request.
        index: usize,
        /// Distilled value or failure.
        result: Result<SimulationValue, Failure>,
    },
}

/// Serializes a message into one frame.
pub fn encode<T: Serialize>(value: &T) -> IoResult<Vec<u8>> {
    let data = serde_json::to_vec(value)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("serialization failed: {e}")))?;

    if data.len() > MAX_FRAME_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("frame size {} exceeds maximum {MAX_FRAME_SIZE}", data.len()),
        ));
    }

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let crc = hasher.finalize();

    #[allow(clippy::cast_possible_truncation)]
    let len = data.len() as u32;

    let mut out = Vec::with_capacity(1 + 4 + data.len() + 4);
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&data);
    out.extend_from_slice(&crc.to_le_bytes());
    Ok(out)
}

/// Reads one frame body, verifying version, size and checksum.
///
/// A clean end of stream before the first byte is reported as
/// `ErrorKind::UnexpectedEof`.
pub fn read_frame(reader: &mut impl Read) -> IoResult<Vec<u8>> {
    let mut version = [0u8; 1];
    reader.read_exact(&mut version)?;

    if version[0] != PROTOCOL_VERSION {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("unsupported protocol version: {} (expected {PROTOCOL_VERSION})", version[0]),
        ));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("frame size {len} exceeds maximum {MAX_FRAME_SIZE}"),
        ));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data)?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes)?;
    let stored_crc = u32::from_le_bytes(crc_bytes);

    let mut hasher = Hasher::new();
    hasher.update(&data);
    let computed_crc = hasher.finalize();

    if stored_crc != computed_crc {
        return Err(IoError::new(
            ErrorKind::InvalidData,
            format!("CRC mismatch: stored={stored_crc:08x}, computed={computed_crc:08x}"),
        ));
    }

    Ok(data)
}

/// Deserializes a frame body.
pub fn parse<T: DeserializeOwned>(body: &[u8]) -> IoResult<T> {
    serde_json::from_slice(body)
        .map_err(|e| IoError::new(ErrorKind::InvalidData, format!("deserialization failed: {e}")))
}

/// Request index of a body that did not parse as a full message.
///
/// Lets an intact but unreadable `Simulate` or `Outcome` be answered as a
/// failure of that one request.
#[must_use]
pub fn frame_index(body: &[u8]) -> Option<usize> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value
        .get("index")
        .and_then(serde_json::Value::as_u64)
        .and_then(|i| usize::try_from(i).ok())
}

/// Reads and deserializes one frame.
pub fn decode<T: DeserializeOwned>(reader: &mut impl Read) -> IoResult<T> {
    parse(&read_frame(reader)?)
}

/// Encodes `value`, writes it and flushes.
pub fn send<T: Serialize>(writer: &mut impl Write, value: &T) -> IoResult<()> {
    let frame = encode(value)?;
    writer.write_all(&frame)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use crate::outcome::FailureKind;

    #[test]
    fn test_command_survives_framing() {
        let cmd = WorkerCommand::Simulate {
            index: 7,
            request: SimulationRequest::new().parameter("E", 3.0e7).filter(["y"]),
            policy: ResultPolicy::FullTrajectory,
        };
        let mut cursor = Cursor::new(encode(&cmd).unwrap());
        let decoded: WorkerCommand = decode(&mut cursor).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn test_reply_with_failure() {
        let reply = WorkerReply::Outcome {
            index: 2,
            result: Err(Failure::new(2, FailureKind::Simulation, "division by zero")),
        };
        let mut buf = Vec::new();
        send(&mut buf, &reply).unwrap();
        let decoded: WorkerReply = decode(&mut Cursor::new(buf)).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn test_detects_corruption() {
        let mut encoded = encode(&WorkerCommand::Shutdown).unwrap();
        encoded[6] ^= 0xFF;

        let result: IoResult<WorkerCommand> = decode(&mut Cursor::new(encoded));
        let err = result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut encoded = encode(&WorkerCommand::Shutdown).unwrap();
        encoded[0] = PROTOCOL_VERSION + 1;

        let err = decode::<WorkerCommand>(&mut Cursor::new(encoded)).unwrap_err();
        assert!(err.to_string().contains("unsupported protocol version"));
    }

    #[test]
    fn test_rejects_oversized_frame() {
        let mut bad = vec![PROTOCOL_VERSION];
        bad.extend_from_slice(&(u32::MAX).to_le_bytes());

        let err = decode::<WorkerCommand>(&mut Cursor::new(bad)).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_non_finite_parameters_cross_intact() {
        let cmd = WorkerCommand::Simulate {
            index: 0,
            request: SimulationRequest::new()
                .parameter("E", f64::NAN)
                .parameter("F", f64::INFINITY)
                .final_time(f64::NEG_INFINITY),
            policy: ResultPolicy::FinalValue,
        };
        let decoded: WorkerCommand = decode(&mut Cursor::new(encode(&cmd).unwrap())).unwrap();
        let WorkerCommand::Simulate { request, .. } = decoded else {
            panic!("expected simulate");
        };
        assert!(request.parameter_value("E").unwrap().is_nan());
        assert_eq!(request.parameter_value("F"), Some(f64::INFINITY));
        assert_eq!(request.options.final_time, Some(f64::NEG_INFINITY));
    }

    #[test]
    fn test_index_of_unreadable_body() {
        let body = br#"{"command":"simulate","index":12,"request":"bogus"}"#;
        assert!(parse::<WorkerCommand>(body).is_err());
        assert_eq!(frame_index(body), Some(12));
        assert_eq!(frame_index(b"{\"command\":\"shutdown\"}"), None);
        assert_eq!(frame_index(b"not json"), None);
    }

    #[test]
    fn test_empty_stream_is_eof() {
        let err = decode::<WorkerReply>(&mut Cursor::new(Vec::new())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
    }
}
