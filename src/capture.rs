//! Bounded audio capture producing voice-command work items.
//!
//! A session pulls 16-bit mono PCM from a [`SampleSource`] until the input
//! ends, the maximum duration is reached, or the user cancels. The RMS
//! level of each chunk is published on a watch channel for meters.
//! Cancelling discards the audio; nothing reaches the queue.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::CaptureConfig;
use crate::error::CaptureError;
use crate::queue::{Attachment, NewWorkItem, Payload};
use crate::registry::Action;

/// Chunk length used for level updates.
const CHUNK: Duration = Duration::from_millis(100);

/// A live source of 16-bit mono samples.
pub trait SampleSource: Send {
  /// Fill `buf` with up to `buf.len()` samples. `Ok(0)` ends the input.
  fn read<'a>(&'a mut self, buf: &'a mut [i16]) -> BoxFuture<'a, Result<usize, CaptureError>>;
}

/// Little-endian PCM from any async reader (a file, stdin, a pipe).
pub struct ReaderSource<R> {
  reader: R,
  bytes: Vec<u8>,
  /// Odd byte left over from the previous read
  carry: Option<u8>,
}

impl<R: AsyncRead + Unpin + Send> ReaderSource<R> {
  pub fn new(reader: R) -> Self {
    Self {
      reader,
      bytes: Vec::new(),
      carry: None,
    }
  }
}

impl<R: AsyncRead + Unpin + Send> SampleSource for ReaderSource<R> {
  fn read<'a>(&'a mut self, buf: &'a mut [i16]) -> BoxFuture<'a, Result<usize, CaptureError>> {
    Box::pin(async move {
      loop {
        self.bytes.clear();
        self.bytes.extend(self.carry);
        let start = self.bytes.len();
        self.bytes.resize(buf.len() * 2, 0);

        let n = self
          .reader
          .read(&mut self.bytes[start..])
          .await
          .map_err(|e| CaptureError::Source(e.to_string()))?;
        let filled = start + n;
        if n == 0 {
          return Ok(0);
        }
        self.carry = None;

        let samples = filled / 2;
        for (i, pair) in self.bytes[..samples * 2].chunks_exact(2).enumerate() {
          buf[i] = i16::from_le_bytes([pair[0], pair[1]]);
        }
        if filled % 2 == 1 {
          self.carry = Some(self.bytes[filled - 1]);
        }
        if samples > 0 {
          return Ok(samples);
        }
      }
    })
  }
}

/// Session limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
  pub max_duration: Duration,
  pub sample_rate: u32,
}

impl From<&CaptureConfig> for CaptureOptions {
  fn from(config: &CaptureConfig) -> Self {
    Self {
      max_duration: Duration::from_secs(config.max_duration_secs),
      sample_rate: config.sample_rate,
    }
  }
}

impl CaptureOptions {
  /// Samples one session may hold. The limits must fit a 32-bit WAV header.
  fn max_samples(&self) -> Result<usize, CaptureError> {
    if self.sample_rate == 0 {
      return Err(CaptureError::Start("sample rate must be positive".to_string()));
    }
    if self.sample_rate.checked_mul(2).is_none() {
      return Err(CaptureError::TooLarge(format!(
        "sample rate {} Hz",
        self.sample_rate
      )));
    }

    let samples = u128::from(self.sample_rate) * self.max_duration.as_millis() / 1000;
    let fits = samples
      .checked_mul(2)
      .is_some_and(|bytes| bytes + 36 <= u128::from(u32::MAX));
    if !fits {
      return Err(CaptureError::TooLarge(format!(
        "{}s at {} Hz",
        self.max_duration.as_secs(),
        self.sample_rate
      )));
    }
    usize::try_from(samples).map_err(|_| CaptureError::TooLarge(format!("{samples} samples")))
  }
}

/// Cancels the session it was created with.
#[derive(Debug, Clone)]
pub struct CancelHandle(std::sync::Arc<watch::Sender<bool>>);

impl CancelHandle {
  pub fn cancel(&self) {
    self.0.send_replace(true);
  }
}

/// Metadata recorded alongside the audio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordingMeta {
  pub duration_ms: u64,
  pub command_type: String,
  pub sample_rate: u32,
  pub started_at: DateTime<Utc>,
}

/// A finished capture.
#[derive(Debug, Clone)]
pub struct Recording {
  /// WAV-encoded audio
  pub audio: Vec<u8>,
  pub meta: RecordingMeta,
  /// Capped by the maximum duration
  pub truncated: bool,
}

impl Recording {
  pub fn payload(&self) -> Payload {
    let data = serde_json::json!({
      "duration_ms": self.meta.duration_ms,
      "command_type": self.meta.command_type,
      "sample_rate": self.meta.sample_rate,
    });
    Payload::new(data).with_attachment(Attachment::new(
      "recording.wav",
      "audio/wav",
      self.audio.clone(),
    ))
  }

  /// Queue entry dated to when the user started speaking.
  pub fn into_work_item(self) -> NewWorkItem {
    let started_at = self.meta.started_at;
    NewWorkItem::new(Action::VoiceCommand, self.payload()).created_at(started_at)
  }
}

pub struct CaptureSession {
  options: CaptureOptions,
  level: watch::Sender<f32>,
  cancel: watch::Receiver<bool>,
}

impl CaptureSession {
  pub fn new(options: CaptureOptions) -> (Self, CancelHandle) {
    let (cancel_tx, cancel) = watch::channel(false);
    let (level, _) = watch::channel(0.0);
    let session = Self {
      options,
      level,
      cancel,
    };
    (session, CancelHandle(std::sync::Arc::new(cancel_tx)))
  }

  /// Live input level in `[0, 1]`.
  pub fn levels(&self) -> watch::Receiver<f32> {
    self.level.subscribe()
  }

  /// Record until the input ends, the limit is hit, or the session is
  /// cancelled.
  pub async fn record<S: SampleSource + ?Sized>(
    mut self,
    source: &mut S,
    command_type: &str,
  ) -> Result<Recording, CaptureError> {
    let max_samples = self.options.max_samples()?;
    let started_at = Utc::now();
    let chunk_len = ((self.options.sample_rate as u128 * CHUNK.as_millis() / 1000) as usize).max(1);

    let mut samples: Vec<i16> = Vec::new();
    let mut chunk = vec![0i16; chunk_len];
    let mut truncated = false;
    let mut cancellable = true;

    loop {
      if *self.cancel.borrow() {
        info!("capture cancelled");
        return Err(CaptureError::Cancelled);
      }
      let remaining = max_samples - samples.len();
      if remaining == 0 {
        truncated = true;
        break;
      }
      let want = remaining.min(chunk_len);

      let read = tokio::select! {
        read = source.read(&mut chunk[..want]) => read,
        changed = self.cancel.changed(), if cancellable => {
          // handle dropped: nobody can cancel any more
          cancellable = changed.is_ok();
          continue;
        }
      };

      let n = match read {
        Ok(n) => n,
        // nothing captured yet: the input never opened
        Err(CaptureError::Source(e)) if samples.is_empty() => return Err(CaptureError::Start(e)),
        Err(e) => return Err(e),
      };
      if n == 0 {
        break;
      }

      self.level.send_replace(rms(&chunk[..n]));
      samples.extend_from_slice(&chunk[..n]);
    }

    if samples.is_empty() {
      return Err(CaptureError::Start("no audio input".to_string()));
    }

    let duration_ms = samples.len() as u64 * 1000 / self.options.sample_rate as u64;
    debug!(duration_ms, truncated, "capture finished");
    self.level.send_replace(0.0);

    Ok(Recording {
      audio: encode_wav(&samples, self.options.sample_rate)?,
      meta: RecordingMeta {
        duration_ms,
        command_type: command_type.to_string(),
        sample_rate: self.options.sample_rate,
        started_at,
      },
      truncated,
    })
  }
}

/// Root-mean-square level normalized to `[0, 1]`.
pub fn rms(samples: &[i16]) -> f32 {
  if samples.is_empty() {
    return 0.0;
  }
  let sum: f64 = samples
    .iter()
    .map(|&s| {
      let v = s as f64 / i16::MAX as f64;
      v * v
    })
    .sum();
  ((sum / samples.len() as f64).sqrt() as f32).min(1.0)
}

/// Canonical 44-byte header RIFF/WAVE, 16-bit mono PCM.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>, CaptureError> {
  let data_len = samples
    .len()
    .checked_mul(2)
    .and_then(|bytes| u32::try_from(bytes).ok())
    .filter(|bytes| bytes.checked_add(36).is_some())
    .ok_or_else(|| CaptureError::TooLarge(format!("{} samples", samples.len())))?;
  let byte_rate = sample_rate
    .checked_mul(2)
    .ok_or_else(|| CaptureError::TooLarge(format!("sample rate {sample_rate} Hz")))?;
  let mut out = Vec::with_capacity(44 + samples.len() * 2);

  out.extend_from_slice(b"RIFF");
  out.extend_from_slice(&(36 + data_len).to_le_bytes());
  out.extend_from_slice(b"WAVE");

  out.extend_from_slice(b"fmt ");
  out.extend_from_slice(&16u32.to_le_bytes());
  out.extend_from_slice(&1u16.to_le_bytes()); // PCM
  out.extend_from_slice(&1u16.to_le_bytes()); // mono
  out.extend_from_slice(&sample_rate.to_le_bytes());
  out.extend_from_slice(&byte_rate.to_le_bytes());
  out.extend_from_slice(&2u16.to_le_bytes()); // block align
  out.extend_from_slice(&16u16.to_le_bytes());

  out.extend_from_slice(b"data");
  out.extend_from_slice(&data_len.to_le_bytes());
  for sample in samples {
    out.extend_from_slice(&sample.to_le_bytes());
  }
  Ok(out)
}
