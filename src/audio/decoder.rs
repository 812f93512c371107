use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
};

use ringbuf::{
    traits::{Observer as _, Producer as _, Split},
    HeapRb,
};
use symphonia::core::{
    audio::{AudioBufferRef, Signal},
    codecs::{DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo, Track},
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
    units::Time,
};

use crate::error::{AutomationError, Result};

/// Stereo f32 samples buffered ahead of the mixer (~3 s at 44.1 kHz)
const RING_CAPACITY: usize = 44100 * 2 * 3;

/// Consumer side of one decode thread, owned by a deck.
pub struct DecoderHandle {
    pub consumer: ringbuf::HeapCons<f32>,
    pub stop_flag: Arc<AtomicBool>,
    /// Set when the decode thread reaches EOF or a fatal error.
    pub decode_done: Arc<AtomicBool>,
    pub frames_written: Arc<AtomicU64>,
    pub sample_rate: u32,
}

impl DecoderHandle {
    /// Decoder finished and every buffered sample has been pulled.
    pub fn is_drained(&self) -> bool {
        self.decode_done.load(Ordering::Relaxed) && self.consumer.is_empty()
    }

    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}

/// Open `path`, seek to `offset_ms` and start a Symphonia decode thread that
/// fills a stereo ring buffer. Fails if the file cannot be probed.
pub fn spawn_decoder(path: &Path, offset_ms: u64) -> Result<DecoderHandle> {
    let (reader, track) = open_media(path)?;
    let sample_rate = track.codec_params.sample_rate.unwrap_or(44100);

    let rb = HeapRb::<f32>::new(RING_CAPACITY);
    let (mut producer, consumer) = rb.split();

    let stop_flag = Arc::new(AtomicBool::new(false));
    let decode_done = Arc::new(AtomicBool::new(false));
    let frames_written = Arc::new(AtomicU64::new(0));

    let handle = DecoderHandle {
        consumer,
        stop_flag: Arc::clone(&stop_flag),
        decode_done: Arc::clone(&decode_done),
        frames_written: Arc::clone(&frames_written),
        sample_rate,
    };

    let owned_path: PathBuf = path.to_path_buf();
    thread::Builder::new()
        .name(format!(
            "dec:{}",
            owned_path.file_name().unwrap_or_default().to_string_lossy()
        ))
        .spawn(move || {
            if let Err(e) = decode_loop(reader, track, offset_ms, &mut producer, &stop_flag, &frames_written) {
                log::warn!("[decoder] {} exited: {e}", owned_path.display());
            }
            decode_done.store(true, Ordering::Relaxed);
        })
        .map_err(|e| AutomationError::Audio(format!("Failed to spawn decoder thread: {e}")))?;

    Ok(handle)
}

fn open_media(path: &Path) -> Result<(Box<dyn FormatReader>, Track)> {
    let file = std::fs::File::open(path)
        .map_err(|e| AutomationError::Audio(format!("Cannot open {}: {e}", path.display())))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| AutomationError::Audio(format!("Probe failed for {}: {e}", path.display())))?;
    let track = probed
        .format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .cloned()
        .ok_or_else(|| AutomationError::Audio(format!("No audio track in {}", path.display())))?;
    Ok((probed.format, track))
}

fn decode_loop(
    mut reader: Box<dyn FormatReader>,
    track: Track,
    offset_ms: u64,
    producer: &mut ringbuf::HeapProd<f32>,
    stop_flag: &AtomicBool,
    frames_written: &AtomicU64,
) -> Result<()> {
    let track_id = track.id;
    let stereo = track.codec_params.channels.map(|c| c.count()).unwrap_or(2) > 1;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AutomationError::Audio(format!("Codec init: {e}")))?;

    if offset_ms > 0 {
        let time = Time::from(offset_ms as f64 / 1000.0);
        if let Err(e) = reader.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time,
                track_id: Some(track_id),
            },
        ) {
            log::warn!("[decoder] seek to {offset_ms} ms failed: {e}");
        }
    }

    loop {
        if stop_flag.load(Ordering::Relaxed) {
            break;
        }
        let packet = match reader.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(e) => {
                log::warn!("[decoder] format read: {e}");
                break;
            }
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                log::warn!("[decoder] decode error (skip): {e}");
                continue;
            }
            Err(e) => {
                log::warn!("[decoder] fatal decode: {e}");
                break;
            }
        };
        let n = push_decoded(decoded, stereo, producer, stop_flag);
        frames_written.fetch_add(n as u64, Ordering::Relaxed);
    }
    Ok(())
}

/// Interleave a decoded buffer as stereo f32 into the ring buffer. Mono is
/// duplicated to both sides. Returns the frames pushed.
fn push_decoded(
    buf: AudioBufferRef<'_>,
    stereo: bool,
    producer: &mut ringbuf::HeapProd<f32>,
    stop_flag: &AtomicBool,
) -> usize {
    macro_rules! push_all {
        ($b:expr, $conv:expr) => {{
            let left = $b.chan(0);
            let right = if stereo { $b.chan(1) } else { $b.chan(0) };
            let mut written = 0;
            for (&l, &r) in left.iter().zip(right.iter()) {
                if !push_frame(producer, stop_flag, $conv(l), $conv(r)) {
                    break;
                }
                written += 1;
            }
            written
        }};
    }

    match buf {
        AudioBufferRef::F32(b) => push_all!(b, |s: f32| s),
        AudioBufferRef::F64(b) => push_all!(b, |s: f64| s as f32),
        AudioBufferRef::S32(b) => push_all!(b, |s: i32| s as f32 / i32::MAX as f32),
        AudioBufferRef::S16(b) => push_all!(b, |s: i16| s as f32 / i16::MAX as f32),
        AudioBufferRef::U8(b) => push_all!(b, |s: u8| (s as f32 - 128.0) / 128.0),
        other => {
            // Unsupported sample format; keep time moving with silence.
            let mut written = 0;
            for _ in 0..other.frames() {
                if !push_frame(producer, stop_flag, 0.0, 0.0) {
                    break;
                }
                written += 1;
            }
            written
        }
    }
}

/// Push one L/R pair, waiting for room for both so the stream never loses
/// interleaving. Returns false when asked to stop.
fn push_frame(producer: &mut ringbuf::HeapProd<f32>, stop_flag: &AtomicBool, l: f32, r: f32) -> bool {
    loop {
        if stop_flag.load(Ordering::Relaxed) {
            return false;
        }
        if producer.vacant_len() >= 2 {
            let _ = producer.try_push(l);
            let _ = producer.try_push(r);
            return true;
        }
        thread::sleep(std::time::Duration::from_millis(2));
    }
}
