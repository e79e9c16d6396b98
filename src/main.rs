use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::info;

use clinic_dictation::adapters::{
    CpalCaptureBackend, SymphoniaDecoder, TomlConfigStore, WhisperCppEngine,
};
use clinic_dictation::infrastructure::init_logging;
use clinic_dictation::ports::ConfigStore;
use clinic_dictation::{TranscriptEvent, VoiceNoteController};

#[derive(Parser)]
#[command(name = "dictate")]
#[command(about = "Record a voice note from the microphone and transcribe it")]
struct Args {
    /// Seconds to record (Ctrl-C stops early)
    #[arg(short, long, default_value = "10")]
    duration: u64,

    /// Whisper model file, overrides transcription.model_path
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Input device id, see --list-devices
    #[arg(long)]
    device: Option<String>,

    /// List input devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Existing note text to append the dictation to
    #[arg(long, default_value = "")]
    note: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let store = TomlConfigStore::new()?;
    let mut config = store.load()?;
    let _log_guard = init_logging(
        &store.logs_dir(),
        &config.logging.level,
        config.logging.file_logging,
    )?;

    if args.device.is_some() {
        config.recording.preferred_device = args.device.clone();
    }
    let model_path = args
        .model
        .clone()
        .or_else(|| config.transcription.model_path.clone().map(PathBuf::from))
        .context("No model given: pass --model or set transcription.model_path")?;

    let controller = VoiceNoteController::new(
        Arc::new(CpalCaptureBackend::new(&config.recording)),
        Arc::new(SymphoniaDecoder::new(config.decoding.target_sample_rate)),
        Arc::new(WhisperCppEngine::new(model_path, &config.transcription)),
        config,
    );

    if args.list_devices {
        for device in controller.list_input_devices().await? {
            let marker = if device.is_default { "*" } else { " " };
            println!("{} {}\t{}", marker, device.id, device.label);
        }
        return Ok(());
    }

    controller.set_note_text(args.note);
    let (events_tx, mut events) = mpsc::unbounded_channel();
    controller.on_transcript(move |event| {
        let _ = events_tx.send(event.clone());
    });

    let handle = controller.record_voice_note().await?;
    let device = handle.session().device_label().to_string();
    info!(device = %device, seconds = args.duration, "Recording voice note");
    eprintln!("Recording from {} for {} seconds...", device, args.duration);

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(args.duration)) => {}
        _ = tokio::signal::ctrl_c() => eprintln!("Stopping early"),
    }

    let completed = handle.stop().await?;
    eprintln!(
        "Transcribing {:.1}s of audio...",
        completed.blob.measured_duration_ms() as f64 / 1000.0
    );

    match events
        .recv()
        .await
        .context("Transcription ended without a result")?
    {
        TranscriptEvent::Ready { note, .. } => println!("{}", note),
        TranscriptEvent::Failed { message, .. } => bail!(message),
        TranscriptEvent::Cancelled { .. } => bail!("Transcription cancelled"),
    }
    Ok(())
}
