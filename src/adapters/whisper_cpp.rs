use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

use crate::domain::config::TranscriptionConfig;
use crate::domain::{DomainError, ProgressEvent, SampleBuffer};
use crate::ports::{EngineHandle, TranscriptionEngine};

const WHISPER_SAMPLE_RATE: u32 = 16_000;

type Progress = Arc<Mutex<Vec<ProgressEvent>>>;

struct JobSlot {
    progress: Progress,
    result: Option<oneshot::Receiver<Result<String, DomainError>>>,
    cancelled: Arc<AtomicBool>,
    started: Arc<AtomicBool>,
}

#[derive(Clone)]
struct InferenceSettings {
    threads: u32,
    language: Option<String>,
}

/// Engine backed by whisper.cpp via whisper-rs.
///
/// The model is loaded on the first job. whisper.cpp cannot be interrupted
/// mid-inference, so cancelling a running job only discards its result.
pub struct WhisperCppEngine {
    model_path: PathBuf,
    settings: InferenceSettings,
    context: Arc<RwLock<Option<Arc<WhisperContext>>>>,
    jobs: Mutex<HashMap<String, JobSlot>>,
    next_id: AtomicU64,
}

impl WhisperCppEngine {
    /// `threads == 0` means auto-detect (cores - 1).
    pub fn new(model_path: impl Into<PathBuf>, config: &TranscriptionConfig) -> Self {
        let threads = if config.threads == 0 {
            std::thread::available_parallelism()
                .map(|p| std::cmp::max(1, p.get() as u32 - 1))
                .unwrap_or(1)
        } else {
            config.threads
        };
        let language = match config.language.as_str() {
            "" | "auto" => None,
            lang => Some(lang.to_string()),
        };
        let model_path = model_path.into();

        info!(threads, model = ?model_path, "WhisperCppEngine created");
        Self {
            model_path,
            settings: InferenceSettings { threads, language },
            context: Arc::new(RwLock::new(None)),
            jobs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn is_model_loaded(&self) -> bool {
        self.context.read().is_some()
    }

    async fn ensure_model(
        context: &RwLock<Option<Arc<WhisperContext>>>,
        path: &Path,
        progress: &Progress,
    ) -> Result<Arc<WhisperContext>, DomainError> {
        if let Some(ctx) = context.read().clone() {
            return Ok(ctx);
        }
        if !path.exists() {
            return Err(DomainError::TranscriptionEngine(format!(
                "Model not found: {}",
                path.display()
            )));
        }

        info!(path = ?path, "Loading whisper model");
        progress.lock().push(ProgressEvent::new("model-weights", 0.0));

        let path_str = path.to_string_lossy().to_string();
        let ctx = tokio::task::spawn_blocking(move || {
            WhisperContext::new_with_params(&path_str, WhisperContextParameters::default())
                .map_err(|e| DomainError::TranscriptionEngine(format!("Failed to load model: {}", e)))
        })
        .await
        .map_err(|e| DomainError::TranscriptionEngine(format!("Task join error: {}", e)))??;

        let ctx = Arc::new(ctx);
        *context.write() = Some(Arc::clone(&ctx));
        progress.lock().push(ProgressEvent::new("model-weights", 1.0));
        info!(path = ?path, "Whisper model loaded");
        Ok(ctx)
    }

    fn infer(
        ctx: &WhisperContext,
        samples: &[f32],
        settings: &InferenceSettings,
    ) -> Result<String, DomainError> {
        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_n_threads(settings.threads as i32);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);
        if let Some(lang) = settings.language.as_deref() {
            params.set_language(Some(lang));
        }

        let mut state = ctx.create_state().map_err(|e| {
            DomainError::TranscriptionEngine(format!("Failed to create whisper state: {}", e))
        })?;
        state
            .full(params, samples)
            .map_err(|e| DomainError::TranscriptionEngine(format!("Transcription failed: {}", e)))?;

        let segments = state.full_n_segments().map_err(|e| {
            DomainError::TranscriptionEngine(format!("Failed to get segment count: {}", e))
        })?;
        let mut text = String::new();
        for i in 0..segments {
            if let Ok(segment) = state.full_get_segment_text(i) {
                text.push_str(&segment);
            }
        }
        Ok(text.trim().to_string())
    }
}

#[async_trait]
impl TranscriptionEngine for WhisperCppEngine {
    async fn submit_job(&self, samples: SampleBuffer) -> Result<EngineHandle, DomainError> {
        if samples.sample_rate() != WHISPER_SAMPLE_RATE {
            return Err(DomainError::TranscriptionEngine(format!(
                "Expected {}Hz audio, got {}Hz",
                WHISPER_SAMPLE_RATE,
                samples.sample_rate()
            )));
        }

        let id = format!("whisper-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let progress: Progress = Arc::new(Mutex::new(Vec::new()));
        let cancelled = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));
        let (result_tx, result_rx) = oneshot::channel();

        self.jobs.lock().insert(
            id.clone(),
            JobSlot {
                progress: Arc::clone(&progress),
                result: Some(result_rx),
                cancelled: Arc::clone(&cancelled),
                started: Arc::clone(&started),
            },
        );

        let mono = samples.to_mono();
        drop(samples);
        let context = Arc::clone(&self.context);
        let model_path = self.model_path.clone();
        let settings = self.settings.clone();
        let job = id.clone();

        tokio::spawn(async move {
            let result = async {
                let ctx = Self::ensure_model(&context, &model_path, &progress).await?;
                if cancelled.load(Ordering::SeqCst) {
                    return Err(DomainError::TranscriptionEngine("cancelled".to_string()));
                }

                started.store(true, Ordering::SeqCst);
                progress.lock().push(ProgressEvent::new("inference", 0.0));
                debug!(job = %job, samples = mono.len(), threads = settings.threads, "Starting inference");

                let start = std::time::Instant::now();
                let text = tokio::task::spawn_blocking(move || {
                    let mut mono = mono;
                    let text = Self::infer(&ctx, &mono, &settings);
                    mono.iter_mut().for_each(|s| *s = 0.0);
                    text
                })
                .await
                .map_err(|e| DomainError::TranscriptionEngine(format!("Task join error: {}", e)))??;

                progress.lock().push(ProgressEvent::new("inference", 1.0));
                info!(
                    job = %job,
                    text_len = text.len(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Transcription complete"
                );
                Ok(text)
            }
            .await;
            let _ = result_tx.send(result);
        });

        Ok(EngineHandle(id))
    }

    async fn poll_progress(&self, handle: &EngineHandle) -> Vec<ProgressEvent> {
        match self.jobs.lock().get(&handle.0) {
            Some(slot) => std::mem::take(&mut *slot.progress.lock()),
            None => Vec::new(),
        }
    }

    async fn result(&self, handle: &EngineHandle) -> Result<String, DomainError> {
        let receiver = self
            .jobs
            .lock()
            .get_mut(&handle.0)
            .and_then(|slot| slot.result.take())
            .ok_or_else(|| DomainError::TranscriptionEngine(format!("Unknown job {}", handle.0)))?;

        let result = receiver.await.map_err(|_| {
            DomainError::TranscriptionEngine("Inference task ended without a result".to_string())
        });
        self.jobs.lock().remove(&handle.0);
        result?
    }

    async fn cancel(&self, handle: &EngineHandle) -> bool {
        let Some(slot) = self.jobs.lock().remove(&handle.0) else {
            return false;
        };
        slot.cancelled.store(true, Ordering::SeqCst);
        let stopped = !slot.started.load(Ordering::SeqCst);
        if !stopped {
            warn!(job = %handle.0, "Inference already running, result will be discarded");
        }
        stopped
    }

    fn name(&self) -> &str {
        "whisper.cpp"
    }
}
