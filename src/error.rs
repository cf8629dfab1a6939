use thiserror::Error;

/// Classified local capture failure. Only `NotFound` is fatal to call setup;
/// the other two leave the call in a retryable state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureError {
    #[error("capture permission denied")]
    PermissionDenied,
    #[error("capture device busy")]
    DeviceBusy,
    #[error("no capture device found")]
    NotFound,
}

impl CaptureError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CaptureError::NotFound)
    }
}

#[derive(Error, Debug)]
pub enum CallError {
    #[error("no active identity")]
    AuthRequired,

    #[error("media unavailable: {0}")]
    MediaUnavailable(#[from] CaptureError),

    #[error("signaling unreachable: {0}")]
    SignalingUnreachable(String),

    #[error("negotiation timed out after {0:?}")]
    NegotiationTimeout(std::time::Duration),

    #[error("call record write failed: {0}")]
    RecordWriteFailed(String),

    #[error("unknown call: {0}")]
    UnknownCall(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CallError {
    /// Whether the caller may retry the failed operation on the same call
    /// without tearing the session down.
    pub fn is_retryable(&self) -> bool {
        match self {
            CallError::MediaUnavailable(e) => e.is_retryable(),
            CallError::SignalingUnreachable(_) => true,
            CallError::RecordWriteFailed(_) => true,
            _ => false,
        }
    }
}
