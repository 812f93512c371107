//! Output sinks that pull the mix in real time.
//!
//! `null` and `wav` run their own clocked render thread; `device` hands the
//! mixer to a cpal output stream (only with the `device-output` feature).

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use super::mixer::Mixer;
use crate::config::OutputKind;
use crate::error::{AutomationError, Result};

/// Mix rate for the clocked sinks
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// 20 ms render blocks
const BLOCKS_PER_SECOND: u32 = 50;

pub struct OutputHandle {
    stop_flag: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl OutputHandle {
    /// Stop rendering and wait for the sink to flush.
    pub fn stop(mut self) -> Result<()> {
        self.stop_flag.store(true, Ordering::Relaxed);
        match self.thread.take() {
            Some(t) => t
                .join()
                .map_err(|_| AutomationError::Audio("output thread panicked".into()))?,
            None => Ok(()),
        }
    }
}

impl Drop for OutputHandle {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}

/// Create the mixer for `kind` and start pulling from it.
pub fn start_output(kind: OutputKind, record_path: &Path) -> Result<(Arc<Mixer>, OutputHandle)> {
    match kind {
        OutputKind::Null => {
            let mixer = Arc::new(Mixer::new(DEFAULT_SAMPLE_RATE));
            let handle = spawn_clocked(Arc::clone(&mixer), None)?;
            Ok((mixer, handle))
        }
        OutputKind::Wav => {
            let mixer = Arc::new(Mixer::new(DEFAULT_SAMPLE_RATE));
            let handle = spawn_clocked(Arc::clone(&mixer), Some(record_path.to_path_buf()))?;
            Ok((mixer, handle))
        }
        OutputKind::Device => start_device(),
    }
}

fn spawn_clocked(mixer: Arc<Mixer>, record_path: Option<PathBuf>) -> Result<OutputHandle> {
    let mut writer = match &record_path {
        Some(path) => {
            let spec = hound::WavSpec {
                channels: 2,
                sample_rate: mixer.sample_rate(),
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let writer = hound::WavWriter::create(path, spec).map_err(|e| {
                AutomationError::Audio(format!("Cannot create {}: {e}", path.display()))
            })?;
            log::info!("[output] recording mix to {}", path.display());
            Some(writer)
        }
        None => None,
    };

    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_t = Arc::clone(&stop_flag);

    let thread = thread::Builder::new()
        .name("mix-out".into())
        .spawn(move || -> Result<()> {
            let frames = (mixer.sample_rate() / BLOCKS_PER_SECOND).max(1) as usize;
            let block = Duration::from_secs(1) / BLOCKS_PER_SECOND;
            let mut buf = vec![0.0f32; frames * 2];
            let started = Instant::now();
            let mut blocks: u32 = 0;

            while !stop_t.load(Ordering::Relaxed) {
                mixer.render(&mut buf);
                if let Some(w) = writer.as_mut() {
                    for &s in &buf {
                        w.write_sample((s * i16::MAX as f32) as i16)
                            .map_err(|e| AutomationError::Audio(format!("WAV write: {e}")))?;
                    }
                }
                blocks = blocks.wrapping_add(1);
                let deadline = started + block * blocks;
                if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
                    thread::sleep(wait);
                }
            }

            if let Some(w) = writer {
                w.finalize()
                    .map_err(|e| AutomationError::Audio(format!("WAV finalize: {e}")))?;
            }
            Ok(())
        })
        .map_err(|e| AutomationError::Audio(format!("Failed to spawn output thread: {e}")))?;

    Ok(OutputHandle {
        stop_flag,
        thread: Some(thread),
    })
}

#[cfg(not(feature = "device-output"))]
fn start_device() -> Result<(Arc<Mixer>, OutputHandle)> {
    Err(AutomationError::Config(
        "built without the device-output feature; use --output null or wav".into(),
    ))
}

#[cfg(feature = "device-output")]
fn start_device() -> Result<(Arc<Mixer>, OutputHandle)> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use std::sync::mpsc;

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AutomationError::Audio("No default audio output device found".into()))?;
    let config = device
        .default_output_config()
        .map_err(|e| AutomationError::Audio(format!("Default config error: {e}")))?;
    let sample_rate = config.sample_rate().0;
    let channels = (config.channels() as usize).max(1);
    log::info!(
        "[output] device: {} | sample rate: {} | channels: {}",
        device.name().unwrap_or_default(),
        sample_rate,
        channels
    );

    let mixer = Arc::new(Mixer::new(sample_rate));
    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_t = Arc::clone(&stop_flag);
    let mixer_cb = Arc::clone(&mixer);
    let (ready_tx, ready_rx) = mpsc::channel::<std::result::Result<(), String>>();

    // The stream is !Send on some platforms, so it lives and dies on this thread.
    let thread = thread::Builder::new()
        .name("mix-out".into())
        .spawn(move || -> Result<()> {
            let mut stereo: Vec<f32> = Vec::new();
            let built = device.build_output_stream(
                &config.into(),
                move |output: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                    if channels == 2 {
                        mixer_cb.render(output);
                        return;
                    }
                    let frames = output.len() / channels;
                    stereo.resize(frames * 2, 0.0);
                    mixer_cb.render(&mut stereo);
                    for (i, frame) in output.chunks_mut(channels).enumerate() {
                        for (c, s) in frame.iter_mut().enumerate() {
                            *s = stereo[i * 2 + c.min(1)];
                        }
                    }
                },
                |e| log::error!("[output] stream error: {e}"),
                None,
            );
            let stream = match built {
                Ok(s) => s,
                Err(e) => {
                    let msg = format!("Build stream error: {e}");
                    let _ = ready_tx.send(Err(msg.clone()));
                    return Err(AutomationError::Audio(msg));
                }
            };
            if let Err(e) = stream.play() {
                let msg = format!("Stream play error: {e}");
                let _ = ready_tx.send(Err(msg.clone()));
                return Err(AutomationError::Audio(msg));
            }
            let _ = ready_tx.send(Ok(()));

            while !stop_t.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(50));
            }
            drop(stream);
            Ok(())
        })
        .map_err(|e| AutomationError::Audio(format!("Failed to spawn output thread: {e}")))?;

    match ready_rx.recv() {
        Ok(Ok(())) => {}
        Ok(Err(msg)) => return Err(AutomationError::Audio(msg)),
        Err(_) => {
            return Err(AutomationError::Audio(
                "output thread exited during startup".into(),
            ))
        }
    }

    Ok((
        mixer,
        OutputHandle {
            stop_flag,
            thread: Some(thread),
        },
    ))
}
