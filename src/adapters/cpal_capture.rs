use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self as std_mpsc, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, DefaultStreamConfigError, Device, Host, SampleFormat, Stream, StreamConfig,
    StreamError,
};
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::HeapRb;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use zeroize::Zeroize;

use crate::adapters::webm_muxer::WebmMuxer;
use crate::domain::config::RecordingConfig;
use crate::domain::{CaptureErrorKind, CaptureRequest, DeviceDescriptor, DomainError, Encoding};
use crate::ports::{CaptureBackend, CaptureSignal, CaptureStream, OpenFailure};

/// Lock-free ring buffer for interleaved samples.
type RingProducer = ringbuf::HeapProd<f32>;
type RingConsumer = ringbuf::HeapCons<f32>;

/// Encodings the muxer can produce.
const SUPPORTED_ENCODINGS: &[&str] = &["audio/webm;codecs=pcm", "audio/webm"];

/// Commands sent to a capture thread.
enum CaptureCommand {
    Start {
        encoding: Encoding,
        sink: mpsc::UnboundedSender<CaptureSignal>,
    },
    Stop,
    Release,
}

#[derive(Debug, Clone, Copy)]
struct ThreadSettings {
    timeslice: Duration,
    buffer_duration_secs: u32,
}

/// Device lookup and stream construction.
mod device_probe {
    use super::*;

    pub struct NamedInput {
        pub id: String,
        pub name: String,
        pub device: Device,
    }

    /// Ids are device names, with `:n` appended to the n-th duplicate.
    pub fn unique_ids(names: &[String]) -> Vec<String> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        names
            .iter()
            .map(|name| {
                let count = counts.entry(name.as_str()).or_insert(0);
                let id = if *count == 0 {
                    name.clone()
                } else {
                    format!("{}:{}", name, count)
                };
                *count += 1;
                id
            })
            .collect()
    }

    pub fn named_inputs(host: &Host) -> Result<Vec<NamedInput>, cpal::DevicesError> {
        let devices: Vec<(String, Device)> = host
            .input_devices()?
            .filter_map(|device| device.name().ok().map(|name| (name, device)))
            .collect();
        let names: Vec<String> = devices.iter().map(|(name, _)| name.clone()).collect();

        Ok(unique_ids(&names)
            .into_iter()
            .zip(devices)
            .map(|(id, (name, device))| NamedInput { id, name, device })
            .collect())
    }

    pub fn list_descriptors() -> Result<Vec<DeviceDescriptor>, DomainError> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());
        let inputs =
            named_inputs(&host).map_err(|e| DomainError::DeviceEnumeration(e.to_string()))?;

        let descriptors: Vec<DeviceDescriptor> = inputs
            .into_iter()
            .map(|input| DeviceDescriptor {
                is_default: default_name.as_deref() == Some(input.name.as_str()),
                id: input.id,
                label: input.name,
                available: true,
            })
            .collect();
        debug!(count = descriptors.len(), "Listed input devices");
        Ok(descriptors)
    }

    pub fn find_device(host: &Host, device_id: Option<&str>) -> Result<Device, OpenFailure> {
        match device_id {
            Some(id) => named_inputs(host)
                .map_err(|e| OpenFailure::Other(format!("Failed to enumerate devices: {}", e)))?
                .into_iter()
                .find(|input| input.id == id)
                .map(|input| input.device)
                .ok_or(OpenFailure::NotFound),
            None => host.default_input_device().ok_or(OpenFailure::NotFound),
        }
    }

    pub fn map_config_error(err: DefaultStreamConfigError) -> OpenFailure {
        match err {
            DefaultStreamConfigError::DeviceNotAvailable => OpenFailure::NotFound,
            other => OpenFailure::Other(format!("Failed to get default config: {}", other)),
        }
    }

    pub fn map_build_error(err: BuildStreamError) -> OpenFailure {
        match err {
            BuildStreamError::DeviceNotAvailable => OpenFailure::NotFound,
            other => OpenFailure::Other(format!("Failed to build stream: {}", other)),
        }
    }

    pub fn i16_to_f32(sample: i16) -> f32 {
        sample as f32 / 32768.0
    }

    pub fn u16_to_f32(sample: u16) -> f32 {
        (sample as f32 - 32768.0) / 32768.0
    }

    fn error_callback(device_lost: Arc<AtomicBool>) -> impl FnMut(StreamError) + Send + 'static {
        move |err| {
            error!(?err, "Audio stream error");
            device_lost.store(true, Ordering::SeqCst);
        }
    }

    pub fn build_stream(
        device: &Device,
        config: &StreamConfig,
        sample_format: SampleFormat,
        mut producer: RingProducer,
        device_lost: Arc<AtomicBool>,
    ) -> Result<Stream, OpenFailure> {
        match sample_format {
            SampleFormat::F32 => device.build_input_stream(
                config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let _ = producer.push_slice(data);
                },
                error_callback(device_lost),
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let _ = producer.push_iter(data.iter().map(|&s| i16_to_f32(s)));
                },
                error_callback(device_lost),
                None,
            ),
            SampleFormat::U16 => device.build_input_stream(
                config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    let _ = producer.push_iter(data.iter().map(|&s| u16_to_f32(s)));
                },
                error_callback(device_lost),
                None,
            ),
            other => {
                return Err(OpenFailure::Other(format!(
                    "Unsupported sample format: {:?}",
                    other
                )))
            }
        }
        .map_err(map_build_error)
    }
}

/// An input device opened on the capture thread.
struct OpenedInput {
    stream: Stream,
    consumer: RingConsumer,
    label: String,
    sample_rate: u32,
    channels: u16,
}

fn open_input(
    device_id: Option<&str>,
    buffer_duration_secs: u32,
    device_lost: Arc<AtomicBool>,
) -> Result<OpenedInput, OpenFailure> {
    let host = cpal::default_host();
    let device = device_probe::find_device(&host, device_id)?;
    let label = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let supported = device
        .default_input_config()
        .map_err(device_probe::map_config_error)?;
    debug!(
        sample_rate = ?supported.sample_rate(),
        channels = supported.channels(),
        format = ?supported.sample_format(),
        "Device default config"
    );

    let config = StreamConfig {
        channels: supported.channels(),
        sample_rate: supported.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };
    let capacity = config.sample_rate.0 as usize
        * config.channels as usize
        * buffer_duration_secs.max(1) as usize;
    let (producer, consumer) = HeapRb::<f32>::new(capacity).split();

    let stream = device_probe::build_stream(
        &device,
        &config,
        supported.sample_format(),
        producer,
        device_lost,
    )?;

    Ok(OpenedInput {
        stream,
        consumer,
        label,
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    })
}

/// Muxing state for one started recording.
struct ActiveCapture {
    sink: mpsc::UnboundedSender<CaptureSignal>,
    muxer: WebmMuxer,
    channels: usize,
    header_sent: bool,
}

impl ActiveCapture {
    /// Emit everything buffered so far as one chunk. The first chunk carries
    /// the container header, so a recording with no audio stays empty.
    fn flush(&mut self, consumer: &mut RingConsumer) {
        let whole_frames = consumer.occupied_len() / self.channels * self.channels;
        if whole_frames == 0 {
            return;
        }

        let mut samples = vec![0f32; whole_frames];
        let read = consumer.pop_slice(&mut samples);
        samples.truncate(read);

        let mut chunk = if self.header_sent {
            Vec::new()
        } else {
            self.header_sent = true;
            self.muxer.header()
        };
        chunk.extend(self.muxer.cluster(&samples));
        samples.zeroize();

        let _ = self.sink.send(CaptureSignal::Chunk(chunk));
    }
}

/// Capture thread runner. The cpal Stream is not Send, so it lives and dies here.
fn capture_thread(
    device_id: Option<String>,
    settings: ThreadSettings,
    ready: oneshot::Sender<Result<String, OpenFailure>>,
    commands: std_mpsc::Receiver<CaptureCommand>,
) {
    let device_lost = Arc::new(AtomicBool::new(false));
    let opened = match open_input(
        device_id.as_deref(),
        settings.buffer_duration_secs,
        Arc::clone(&device_lost),
    ) {
        Ok(opened) => opened,
        Err(failure) => {
            let _ = ready.send(Err(failure));
            return;
        }
    };
    let OpenedInput {
        stream,
        mut consumer,
        label,
        sample_rate,
        channels,
    } = opened;
    let _ = ready.send(Ok(label.clone()));

    let mut active: Option<ActiveCapture> = None;
    loop {
        match commands.recv_timeout(settings.timeslice) {
            Ok(CaptureCommand::Start { encoding, sink }) => {
                if let Err(e) = stream.play() {
                    let _ = sink.send(CaptureSignal::Error(format!("Failed to start stream: {}", e)));
                    continue;
                }
                // Drop anything captured before the recording started.
                consumer.clear();
                info!(device = %label, encoding = %encoding, sample_rate, channels, "Capture started");
                active = Some(ActiveCapture {
                    sink,
                    muxer: WebmMuxer::new(sample_rate, channels),
                    channels: channels.max(1) as usize,
                    header_sent: false,
                });
            }
            Ok(CaptureCommand::Stop) => {
                if let Some(mut capture) = active.take() {
                    if let Err(e) = stream.pause() {
                        debug!(error = %e, "Stream pause not supported");
                    }
                    capture.flush(&mut consumer);
                    let _ = capture.sink.send(CaptureSignal::Drained);
                    debug!(frames = capture.muxer.frames_written(), "Capture drained");
                }
            }
            Ok(CaptureCommand::Release) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        if device_lost.swap(false, Ordering::SeqCst) {
            if let Some(capture) = active.take() {
                let _ = capture
                    .sink
                    .send(CaptureSignal::Error(format!("Input device {} was lost", label)));
            }
        }
        if let Some(capture) = active.as_mut() {
            capture.flush(&mut consumer);
        }
    }

    drop(stream);
    debug!(device = %label, "Capture thread shutting down");
}

/// Handle on a capture thread.
struct CpalCaptureStream {
    label: String,
    commands: std_mpsc::Sender<CaptureCommand>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureStream for CpalCaptureStream {
    fn label(&self) -> &str {
        &self.label
    }

    fn start(
        &mut self,
        encoding: &Encoding,
        sink: mpsc::UnboundedSender<CaptureSignal>,
    ) -> Result<(), DomainError> {
        if !SUPPORTED_ENCODINGS.contains(&encoding.as_str()) {
            return Err(DomainError::capture(
                CaptureErrorKind::Unknown,
                format!("cannot record as {}", encoding),
            ));
        }
        self.commands
            .send(CaptureCommand::Start {
                encoding: encoding.clone(),
                sink,
            })
            .map_err(|_| DomainError::capture(CaptureErrorKind::Unknown, "Capture thread not running"))
    }

    fn request_stop(&mut self) {
        if self.commands.send(CaptureCommand::Stop).is_err() {
            warn!(device = %self.label, "Capture thread already gone");
        }
    }

    fn release(&mut self) {
        let _ = self.commands.send(CaptureCommand::Release);
        if let Some(handle) = self.thread.take() {
            reap(handle);
        }
    }
}

/// Join a capture thread that has been told to exit. The thread can take up
/// to one timeslice to notice, so inside a runtime the wait moves to the
/// blocking pool instead of stalling a worker.
fn reap(handle: JoinHandle<()>) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn_blocking(move || {
                if handle.join().is_err() {
                    warn!("Capture thread panicked");
                }
            });
        }
        Err(_) => {
            if handle.join().is_err() {
                warn!("Capture thread panicked");
            }
        }
    }
}

impl Drop for CpalCaptureStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Microphone capture through cpal.
///
/// Each opened device gets its own thread that owns the cpal stream, buffers
/// samples in a ring and emits one WebM cluster per timeslice.
pub struct CpalCaptureBackend {
    settings: ThreadSettings,
}

impl CpalCaptureBackend {
    pub fn new(config: &RecordingConfig) -> Self {
        let settings = ThreadSettings {
            timeslice: Duration::from_millis(config.timeslice_ms.max(10)),
            buffer_duration_secs: config.buffer_duration_secs,
        };
        info!(
            timeslice_ms = settings.timeslice.as_millis() as u64,
            buffer_duration_secs = settings.buffer_duration_secs,
            "CpalCaptureBackend initialized"
        );
        Self { settings }
    }
}

#[async_trait]
impl CaptureBackend for CpalCaptureBackend {
    async fn enumerate(&self) -> Result<Vec<DeviceDescriptor>, DomainError> {
        tokio::task::spawn_blocking(device_probe::list_descriptors)
            .await
            .map_err(|e| DomainError::DeviceEnumeration(format!("enumeration task failed: {}", e)))?
    }

    async fn open(&self, request: &CaptureRequest) -> Result<Box<dyn CaptureStream>, OpenFailure> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (commands, command_rx) = std_mpsc::channel();
        let device_id = request.device_id.clone();
        let settings = self.settings;

        let thread = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || capture_thread(device_id, settings, ready_tx, command_rx))
            .map_err(|e| OpenFailure::Other(format!("Failed to spawn capture thread: {}", e)))?;

        let label = ready_rx
            .await
            .map_err(|_| OpenFailure::Other("Capture thread exited during open".to_string()))??;

        Ok(Box::new(CpalCaptureStream {
            label,
            commands,
            thread: Some(thread),
        }))
    }

    fn is_supported(&self, encoding: &str) -> bool {
        SUPPORTED_ENCODINGS.contains(&encoding)
    }
}
