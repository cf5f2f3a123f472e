//! # Compute Device Probing
//!
//! Decides which compute devices the model loader should try, in order, and
//! classifies construction failures so the lifecycle manager knows whether a
//! fallback to the next device makes sense.
//!
//! ## Key Features:
//! - **Preference order**: CUDA GPU first (when allowed and roomy enough), then CPU
//! - **Failure classification**: out-of-memory style errors are retryable on
//!   another device, everything else is fatal
//! - **Advisory only**: the probe never loads anything, the loader has the final say

use candle_core::Device;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::process::Command;
use tracing::{debug, info};

/// A device an inference resource can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputeDevice {
    Cuda { ordinal: usize },
    Cpu,
}

impl ComputeDevice {
    /// Wire name used in responses and logs (`"cuda"` / `"cpu"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeDevice::Cuda { .. } => "cuda",
            ComputeDevice::Cpu => "cpu",
        }
    }

    /// Open the matching candle device.
    pub fn to_candle(&self) -> candle_core::Result<Device> {
        match self {
            ComputeDevice::Cuda { ordinal } => Device::new_cuda(*ordinal),
            ComputeDevice::Cpu => Ok(Device::Cpu),
        }
    }
}

impl fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeDevice::Cuda { ordinal } => write!(f, "cuda:{}", ordinal),
            ComputeDevice::Cpu => write!(f, "cpu"),
        }
    }
}

impl Serialize for ComputeDevice {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Which devices the operator allows the service to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// GPU when it is usable and has enough free memory, CPU otherwise
    #[default]
    Auto,
    /// CPU only
    Cpu,
    /// GPU first even when free memory looks low, CPU as the fallback
    Cuda,
}

impl std::str::FromStr for DevicePreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" | "automatic" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            _ => Err(format!("Unknown device preference: {}", s)),
        }
    }
}

/// How a failed construction attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The device ran out of memory; the next device in the list may still work
    ResourceExhausted,
    /// Anything else: missing weights, corrupt files, bad configuration
    Fatal,
}

/// Device-availability seam used by the lifecycle manager.
///
/// The production implementation is [`DeviceProber`]; tests plug in fakes to
/// force fallback paths without a GPU.
pub trait DeviceProbe: Send + Sync {
    /// Devices to try, most preferred first. Must end with a device that can
    /// always be opened (CPU) unless the operator restricted the list.
    fn preference_order(&self) -> Vec<ComputeDevice>;

    /// Classify a construction failure.
    fn classify(&self, error: &anyhow::Error) -> FailureClass {
        classify_failure(error)
    }
}

/// Error messages that indicate memory exhaustion on the device or the host.
const EXHAUSTION_MARKERS: &[&str] = &[
    "out of memory",
    "out_of_memory",
    "outofmemory",
    "failed to allocate",
    "cannot allocate memory",
    "memory allocation failed",
];

/// Walk the error chain looking for memory exhaustion.
pub fn classify_failure(error: &anyhow::Error) -> FailureClass {
    for cause in error.chain() {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::OutOfMemory {
                return FailureClass::ResourceExhausted;
            }
        }

        let message = cause.to_string().to_lowercase();
        if EXHAUSTION_MARKERS.iter().any(|marker| message.contains(marker)) {
            return FailureClass::ResourceExhausted;
        }
    }

    FailureClass::Fatal
}

/// Probes the host for CUDA availability and free memory.
pub struct DeviceProber {
    preference: DevicePreference,
    min_free_memory_mb: u64,
}

impl DeviceProber {
    pub fn new(preference: DevicePreference, min_free_memory_mb: u64) -> Self {
        Self {
            preference,
            min_free_memory_mb,
        }
    }

    /// Try to open CUDA device 0
    fn cuda_usable(&self) -> bool {
        if !candle_core::utils::cuda_is_available() {
            debug!("Built without CUDA support");
            return false;
        }

        match Device::new_cuda(0) {
            Ok(_) => true,
            Err(e) => {
                debug!("CUDA not available: {}", e);
                false
            }
        }
    }

    /// Free memory on GPU 0 in MiB, if `nvidia-smi` can tell us.
    fn cuda_free_memory_mb(&self) -> Option<u64> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=memory.free",
                "--format=csv,noheader,nounits",
                "-i",
                "0",
            ])
            .output()
            .ok()?;

        if !output.status.success() {
            return None;
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .and_then(|line| line.trim().parse::<u64>().ok())
    }
}

impl DeviceProbe for DeviceProber {
    fn preference_order(&self) -> Vec<ComputeDevice> {
        let gpu = ComputeDevice::Cuda { ordinal: 0 };

        let include_gpu = match self.preference {
            DevicePreference::Cpu => false,
            DevicePreference::Cuda => self.cuda_usable(),
            DevicePreference::Auto => {
                if !self.cuda_usable() {
                    false
                } else {
                    // Unknown free memory still gets a try; the loader reports
                    // exhaustion and the manager falls back.
                    match self.cuda_free_memory_mb() {
                        Some(free) if free < self.min_free_memory_mb => {
                            info!(
                                free_mb = free,
                                required_mb = self.min_free_memory_mb,
                                "Skipping GPU: not enough free memory"
                            );
                            false
                        }
                        _ => true,
                    }
                }
            }
        };

        let mut order = Vec::with_capacity(2);
        if include_gpu {
            order.push(gpu);
        }
        order.push(ComputeDevice::Cpu);

        debug!(?order, "Device preference order");
        order
    }
}
