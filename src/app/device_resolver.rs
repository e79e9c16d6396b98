use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::domain::{CaptureErrorKind, CaptureRequest, DeviceDescriptor, DomainError};
use crate::ports::{CaptureBackend, CaptureStream, OpenFailure};

/// An opened device, plus the id that had to be given up to get it.
pub struct Acquisition {
    pub stream: Box<dyn CaptureStream>,
    /// Set when the requested device failed and any input was used instead.
    pub fell_back_from: Option<String>,
}

/// Enumerates inputs and opens them with a constrained-then-unconstrained
/// retry policy.
///
/// Keeps the latest enumeration as an explicit snapshot, replaced wholesale on
/// every refresh. Devices come and go while the app runs, so the recorder
/// refreshes on each start.
pub struct DeviceResolver {
    backend: Arc<dyn CaptureBackend>,
    snapshot: RwLock<Vec<DeviceDescriptor>>,
}

impl DeviceResolver {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            snapshot: RwLock::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn CaptureBackend> {
        &self.backend
    }

    /// Enumerate audio inputs and replace the snapshot.
    ///
    /// An empty list is a valid answer (no hardware, or permission not yet
    /// granted). A refused enumeration clears the snapshot.
    pub async fn list_input_devices(&self) -> Result<Vec<DeviceDescriptor>, DomainError> {
        match self.backend.enumerate().await {
            Ok(devices) => {
                debug!(count = devices.len(), "Enumerated input devices");
                *self.snapshot.write() = devices.clone();
                Ok(devices)
            }
            Err(e) => {
                self.snapshot.write().clear();
                Err(match e {
                    DomainError::DeviceEnumeration(_) => e,
                    other => DomainError::DeviceEnumeration(other.to_string()),
                })
            }
        }
    }

    /// Re-enumerate, tolerating failure. Returns the number of devices seen.
    pub async fn refresh(&self) -> usize {
        match self.list_input_devices().await {
            Ok(devices) => devices.len(),
            Err(e) => {
                warn!(error = %e, "Device enumeration failed, continuing with empty device list");
                0
            }
        }
    }

    /// The devices seen by the last enumeration.
    pub fn snapshot(&self) -> Vec<DeviceDescriptor> {
        self.snapshot.read().clone()
    }

    /// Request `preferred` only if the last enumeration saw it available.
    pub fn build_capture_request(&self, preferred: Option<&str>) -> CaptureRequest {
        let Some(id) = preferred else {
            return CaptureRequest::any();
        };

        let known = self
            .snapshot
            .read()
            .iter()
            .any(|device| device.id == id && device.available);
        if known {
            CaptureRequest::for_device(id)
        } else {
            debug!(device = id, "Preferred device not available, requesting any input");
            CaptureRequest::any()
        }
    }

    /// Open a device for `request`.
    pub async fn acquire(
        &self,
        request: &CaptureRequest,
    ) -> Result<Box<dyn CaptureStream>, DomainError> {
        self.open_with_fallback(request).await.map(|a| a.stream)
    }

    /// Open a device, retrying once without the device constraint.
    ///
    /// Only `NotFound` and unclassified failures are retried, and only when
    /// the request allows it. Denied, busy and insecure-context failures are
    /// final.
    pub async fn open_with_fallback(
        &self,
        request: &CaptureRequest,
    ) -> Result<Acquisition, DomainError> {
        let failure = match self.backend.open(request).await {
            Ok(stream) => {
                info!(device = %stream.label(), "Input device opened");
                return Ok(Acquisition {
                    stream,
                    fell_back_from: None,
                });
            }
            Err(failure) => failure,
        };

        let retryable = matches!(failure, OpenFailure::NotFound | OpenFailure::Other(_));
        if !(request.is_constrained() && request.allow_fallback && retryable) {
            return Err(self.classify(&failure));
        }

        warn!(
            device = ?request.device_id,
            error = %failure,
            "Requested device could not be opened, retrying with any input"
        );
        match self.backend.open(&request.relaxed()).await {
            Ok(stream) => {
                info!(device = %stream.label(), "Fallback input device opened");
                Ok(Acquisition {
                    stream,
                    fell_back_from: request.device_id.clone(),
                })
            }
            Err(second) => Err(self.classify(&second)),
        }
    }

    fn classify(&self, failure: &OpenFailure) -> DomainError {
        let kind = match failure {
            OpenFailure::PermissionDenied => CaptureErrorKind::PermissionDenied,
            OpenFailure::DeviceBusy => CaptureErrorKind::DeviceBusy,
            OpenFailure::InsecureContext => CaptureErrorKind::InsecureContext,
            OpenFailure::NotFound | OpenFailure::Other(_) => {
                if self.snapshot.read().is_empty() {
                    CaptureErrorKind::NoMicrophone
                } else {
                    CaptureErrorKind::Unknown
                }
            }
        };
        warn!(kind = %kind, error = %failure, "Could not open an input device");
        DomainError::capture(kind, failure.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{device, FakeCaptureBackend};

    fn resolver(backend: &Arc<FakeCaptureBackend>) -> DeviceResolver {
        DeviceResolver::new(Arc::clone(backend) as Arc<dyn CaptureBackend>)
    }

    #[tokio::test]
    async fn test_list_replaces_snapshot() {
        let backend = Arc::new(FakeCaptureBackend::new());
        let resolver = resolver(&backend);

        assert_eq!(resolver.list_input_devices().await.unwrap().len(), 1);
        backend.set_devices(vec![device("a", "USB"), device("b", "Headset")]);
        assert_eq!(resolver.list_input_devices().await.unwrap().len(), 2);
        assert_eq!(resolver.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_empty_enumeration_is_not_an_error() {
        let backend = Arc::new(FakeCaptureBackend::with_devices(Vec::new()));
        let resolver = resolver(&backend);
        assert!(resolver.list_input_devices().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_denied_enumeration_clears_snapshot() {
        let backend = Arc::new(FakeCaptureBackend::new());
        let resolver = resolver(&backend);
        resolver.refresh().await;
        assert_eq!(resolver.snapshot().len(), 1);

        backend.deny_enumeration("blocked by policy");
        let err = resolver.list_input_devices().await.unwrap_err();
        assert!(matches!(err, DomainError::DeviceEnumeration(_)));
        assert!(resolver.snapshot().is_empty());
        assert_eq!(resolver.refresh().await, 0);
    }

    #[tokio::test]
    async fn test_request_constrained_only_for_known_device() {
        let backend = Arc::new(FakeCaptureBackend::with_devices(vec![
            device("usb", "USB Mic"),
            DeviceDescriptor {
                available: false,
                ..device("bt", "Bluetooth")
            },
        ]));
        let resolver = resolver(&backend);
        resolver.refresh().await;

        assert_eq!(
            resolver.build_capture_request(Some("usb")),
            CaptureRequest::for_device("usb")
        );
        assert!(!resolver.build_capture_request(Some("bt")).is_constrained());
        assert!(!resolver.build_capture_request(Some("gone")).is_constrained());
        assert!(!resolver.build_capture_request(None).is_constrained());
    }

    #[tokio::test]
    async fn test_fallback_retries_once_unconstrained() {
        let backend = Arc::new(FakeCaptureBackend::new());
        backend.script_open([Err(OpenFailure::NotFound)]);
        let resolver = resolver(&backend);
        resolver.refresh().await;

        let acquired = resolver
            .open_with_fallback(&CaptureRequest::for_device("usb"))
            .await
            .unwrap();
        assert_eq!(acquired.fell_back_from.as_deref(), Some("usb"));

        let attempts = backend.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[0].is_constrained());
        assert!(!attempts[1].is_constrained());
    }

    #[tokio::test]
    async fn test_no_fallback_when_disallowed() {
        let backend = Arc::new(FakeCaptureBackend::new());
        backend.script_open([Err(OpenFailure::NotFound)]);
        let resolver = resolver(&backend);
        resolver.refresh().await;

        let request = CaptureRequest {
            device_id: Some("usb".to_string()),
            allow_fallback: false,
        };
        let err = resolver.acquire(&request).await.err().unwrap();
        assert_eq!(err.capture_kind(), Some(CaptureErrorKind::Unknown));
        assert_eq!(backend.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_final_failures_are_never_retried() {
        for (failure, kind) in [
            (OpenFailure::PermissionDenied, CaptureErrorKind::PermissionDenied),
            (OpenFailure::DeviceBusy, CaptureErrorKind::DeviceBusy),
            (OpenFailure::InsecureContext, CaptureErrorKind::InsecureContext),
        ] {
            let backend = Arc::new(FakeCaptureBackend::new());
            backend.script_open([Err(failure)]);
            let resolver = resolver(&backend);
            resolver.refresh().await;

            let err = resolver
                .acquire(&CaptureRequest::for_device("builtin"))
                .await
                .err()
                .unwrap();
            assert_eq!(err.capture_kind(), Some(kind));
            assert_eq!(backend.attempts().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_no_devices_and_not_found_twice_is_no_microphone() {
        let backend = Arc::new(FakeCaptureBackend::with_devices(Vec::new()));
        backend.script_open([Err(OpenFailure::NotFound), Err(OpenFailure::NotFound)]);
        let resolver = resolver(&backend);
        resolver.refresh().await;

        let err = resolver
            .acquire(&CaptureRequest::for_device("usb"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.capture_kind(), Some(CaptureErrorKind::NoMicrophone));
        assert_eq!(backend.attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_not_found_with_devices_is_unknown() {
        let backend = Arc::new(FakeCaptureBackend::new());
        backend.script_open([
            Err(OpenFailure::NotFound),
            Err(OpenFailure::Other("driver error".to_string())),
        ]);
        let resolver = resolver(&backend);
        resolver.refresh().await;

        let err = resolver
            .acquire(&CaptureRequest::for_device("usb"))
            .await
            .err()
            .unwrap();
        assert_eq!(err.capture_kind(), Some(CaptureErrorKind::Unknown));
    }
}
