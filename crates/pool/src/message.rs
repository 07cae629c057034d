use offload_core::RuntimeFlags;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Correlation id linking a submitted task to its response.
pub type TaskId = u64;

/// Index of a worker slot, `0..size`.
pub type WorkerId = usize;

/// Encoded message crossing the worker boundary.
///
/// Frames are MessagePack bytes; nothing but a frame is shared between the
/// control loop and a worker thread.
pub type Frame = Vec<u8>;

/// Message sent from the control loop to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Run one task. The worker must answer with exactly one [`Response`].
    Task {
        id: TaskId,
        task_type: String,
        payload: Value,
    },
    /// Merge runtime flags into the worker's local copy. Never answered.
    Config { flags: RuntimeFlags },
}

/// Message sent from a worker back to the control loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: TaskId,
    pub outcome: Outcome,
}

/// Result of running a task inside a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Success(Value),
    Failure(String),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

impl Request {
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_frame(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl Response {
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    pub fn from_frame(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn task_request_survives_the_boundary() {
        let request = Request::Task {
            id: 7,
            task_type: "computeBatch".into(),
            payload: json!({"coins": {"BTC": {"price": 64000.5, "history": [1, 2, 3]}}}),
        };
        let frame = request.to_frame().unwrap();
        assert_eq!(Request::from_frame(&frame).unwrap(), request);
    }

    #[test]
    fn config_request_carries_flags() {
        let flags: RuntimeFlags = [("emit_legacy", false)].into_iter().collect();
        let frame = Request::Config { flags: flags.clone() }.to_frame().unwrap();

        match Request::from_frame(&frame).unwrap() {
            Request::Config { flags: decoded } => assert_eq!(decoded, flags),
            other => panic!("expected config request, got {other:?}"),
        }
    }

    #[test]
    fn failure_response_keeps_message() {
        let response = Response {
            id: 3,
            outcome: Outcome::Failure("Unknown task type: nope".into()),
        };
        let decoded = Response::from_frame(&response.to_frame().unwrap()).unwrap();
        assert_eq!(decoded.id, 3);
        assert!(!decoded.outcome.is_success());
    }

    #[test]
    fn garbage_frame_is_a_decode_error() {
        let err = Response::from_frame(&[0xc1, 0x00, 0xff]).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }
}
