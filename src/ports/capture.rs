use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::domain::{CaptureRequest, DeviceDescriptor, DomainError, Encoding};

/// Why the platform refused to open an input device.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenFailure {
    #[error("requested device not found")]
    NotFound,
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("device is in use")]
    DeviceBusy,
    #[error("capture requires a secure context")]
    InsecureContext,
    #[error("{0}")]
    Other(String),
}

/// Messages from a running capture primitive to the recorder.
#[derive(Debug)]
pub enum CaptureSignal {
    /// Encoded container bytes, in capture order.
    Chunk(Vec<u8>),
    /// No more chunks will follow the stop request.
    Drained,
    /// The device failed mid-capture.
    Error(String),
}

/// An opened input device.
///
/// Implementations must deliver every chunk through the sink given to
/// [`CaptureStream::start`], in order, and send [`CaptureSignal::Drained`]
/// once a stop request has been fully flushed.
pub trait CaptureStream: Send {
    /// Label of the device actually opened.
    fn label(&self) -> &str;

    /// Begin encoding captured audio as `encoding`.
    fn start(
        &mut self,
        encoding: &Encoding,
        sink: mpsc::UnboundedSender<CaptureSignal>,
    ) -> Result<(), DomainError>;

    /// Ask the primitive to flush. Chunks may still arrive until `Drained`.
    fn request_stop(&mut self);

    /// Stop all tracks and free the device.
    fn release(&mut self);
}

/// Port for the platform's audio input layer.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    /// List audio input devices.
    ///
    /// Some platforms report nothing until microphone permission has been
    /// granted; an empty list is not an error.
    async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, DomainError>;

    /// Open a device matching `request`.
    async fn open(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureStream>, OpenFailure>;

    /// Whether the recorder can produce `encoding` (a MIME identifier).
    fn is_supported(&self, encoding: &str) -> bool;
}
