//! # Transcription Errors
//!
//! Failure taxonomy shared by the lifecycle manager and the executor. Values
//! are `Clone` because one failed load is reported to every caller that was
//! waiting on it.

use crate::device::ComputeDevice;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// The last device in the preference list ran out of memory
    ResourceExhausted {
        device: ComputeDevice,
        message: String,
    },

    /// Construction failed for a reason another device would not fix
    ConstructionFatal {
        device: Option<ComputeDevice>,
        message: String,
    },

    /// The audio could not be used (empty, undecodable)
    InvalidInput(String),

    /// Inference itself failed; the resource stays loaded
    InferenceFailed(String),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::ResourceExhausted { device, message } => {
                write!(f, "Resource exhausted on {}: {}", device, message)
            }
            ModelError::ConstructionFatal {
                device: Some(device),
                message,
            } => write!(f, "Model construction failed on {}: {}", device, message),
            ModelError::ConstructionFatal {
                device: None,
                message,
            } => write!(f, "Model construction failed: {}", message),
            ModelError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            ModelError::InferenceFailed(msg) => write!(f, "Inference failed: {}", msg),
        }
    }
}

impl std::error::Error for ModelError {}
