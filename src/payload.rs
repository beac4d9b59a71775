//! Tagged result values stored in result slots.
//!
//! A slot holds exactly one [`SlotPayload`]: serialized value bytes, a void
//! marker, or an error code. The tag lives next to the bytes, so a task
//! result can never be mistaken for a marker.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Raw tag values as written into a slot entry.
pub(crate) const TAG_VALUE: u32 = 0;
pub(crate) const TAG_VOID: u32 = 1;
pub(crate) const TAG_ERROR: u32 = 2;

/// Why a slot holds an error instead of a value.
///
/// Only the code crosses the process boundary; the worker logs the details.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// The task returned `Err`.
    TaskFailed,
    /// The task panicked.
    TaskPanicked,
    /// The task's value could not be serialized.
    EncodeFailed,
    /// The segment arena had no room for the value bytes.
    SegmentFull,
    /// The worker terminated without publishing a result.
    WorkerDied,
    /// The parent could not deserialize the value into the promise's type.
    DecodeFailed,
    /// The segment was removed before the worker published a result.
    SegmentRemoved,
    /// A code written by a newer version of this crate.
    Other(u32),
}

impl ErrorCode {
    pub const fn as_raw(self) -> u32 {
        match self {
            Self::TaskFailed => 1,
            Self::TaskPanicked => 2,
            Self::EncodeFailed => 3,
            Self::SegmentFull => 4,
            Self::WorkerDied => 5,
            Self::DecodeFailed => 6,
            Self::SegmentRemoved => 7,
            Self::Other(code) => code,
        }
    }

    pub const fn from_raw(raw: u32) -> Self {
        match raw {
            1 => Self::TaskFailed,
            2 => Self::TaskPanicked,
            3 => Self::EncodeFailed,
            4 => Self::SegmentFull,
            5 => Self::WorkerDied,
            6 => Self::DecodeFailed,
            7 => Self::SegmentRemoved,
            other => Self::Other(other),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TaskFailed => write!(f, "task returned an error"),
            Self::TaskPanicked => write!(f, "task panicked"),
            Self::EncodeFailed => write!(f, "task value could not be serialized"),
            Self::SegmentFull => write!(f, "segment had no room for the task value"),
            Self::WorkerDied => write!(f, "worker terminated without a result"),
            Self::DecodeFailed => write!(f, "task value could not be deserialized"),
            Self::SegmentRemoved => write!(f, "segment removed before a result arrived"),
            Self::Other(code) => write!(f, "error code {}", code),
        }
    }
}

/// One task outcome as stored in the segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotPayload {
    /// JSON-encoded task value.
    Value(Vec<u8>),
    /// The task ran and produced nothing.
    Void,
    /// The task did not produce a usable value.
    Error(ErrorCode),
}

impl SlotPayload {
    /// Encode a task value.
    ///
    /// Values that serialize to JSON `null` (`()`, `None`) become [`SlotPayload::Void`].
    pub fn encode<T: Serialize>(value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(bytes) if bytes == b"null" => Self::Void,
            Ok(bytes) => Self::Value(bytes),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize task value");
                Self::Error(ErrorCode::EncodeFailed)
            }
        }
    }

    /// Decode a value payload into `T`.
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> serde_json::Result<T> {
        serde_json::from_slice(bytes)
    }

    pub(crate) fn tag(&self) -> u32 {
        match self {
            Self::Value(_) => TAG_VALUE,
            Self::Void => TAG_VOID,
            Self::Error(_) => TAG_ERROR,
        }
    }

    pub(crate) fn code(&self) -> u32 {
        match self {
            Self::Error(code) => code.as_raw(),
            _ => 0,
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        match self {
            Self::Value(bytes) => bytes,
            _ => &[],
        }
    }

    /// Rebuild a payload from the raw fields of a slot entry.
    pub(crate) fn from_parts(tag: u32, code: u32, bytes: Vec<u8>) -> Self {
        match tag {
            TAG_VALUE => Self::Value(bytes),
            TAG_VOID => Self::Void,
            _ => Self::Error(ErrorCode::from_raw(code)),
        }
    }
}
