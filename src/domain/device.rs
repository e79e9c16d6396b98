use serde::{Deserialize, Serialize};

/// One audio input source as reported by the capture backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Opaque device identifier, stable for the lifetime of the device.
    pub id: String,
    /// Human-readable label. May be empty before permission is granted.
    pub label: String,
    /// Whether the device can currently be opened.
    pub available: bool,
    /// Whether this is the platform default input.
    pub is_default: bool,
}

/// Constraints for a single attempt at opening an input device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureRequest {
    /// Exact device to open, or `None` for any available input.
    pub device_id: Option<String>,
    /// Whether a failed exact-device open may be retried unconstrained.
    pub allow_fallback: bool,
}

impl CaptureRequest {
    /// Request any available input.
    pub fn any() -> Self {
        Self {
            device_id: None,
            allow_fallback: true,
        }
    }

    /// Request a specific device, falling back to any input if it fails.
    pub fn for_device(id: impl Into<String>) -> Self {
        Self {
            device_id: Some(id.into()),
            allow_fallback: true,
        }
    }

    /// Whether this request pins a specific device.
    pub fn is_constrained(&self) -> bool {
        self.device_id.is_some()
    }

    /// The unconstrained variant of this request.
    pub fn relaxed(&self) -> Self {
        Self {
            device_id: None,
            allow_fallback: false,
        }
    }
}
