//! Replays a 16-bit WAV file as if it were a live microphone.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose;
use base64::Engine;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::CaptureSource;
use crate::error::{LiveError, Result};

const CHUNK_DURATION_MS: u64 = 100;
const CHANNEL_CAPACITY: usize = 32;

#[derive(Debug)]
pub struct WavFileSource {
    path: PathBuf,
    sample_rate: u32,
    samples: Arc<Vec<i16>>,
    chunk_duration: Duration,
    task: Option<JoinHandle<()>>,
}

impl WavFileSource {
    /// Load a mono 16-bit WAV file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut reader = hound::WavReader::open(&path)?;
        let spec = reader.spec();
        if spec.channels != 1
            || spec.bits_per_sample != 16
            || spec.sample_format != hound::SampleFormat::Int
        {
            warn!("Unsupported capture file format: {:?}", spec);
            return Err(LiveError::Audio(hound::Error::Unsupported));
        }

        let samples = reader
            .samples::<i16>()
            .collect::<std::result::Result<Vec<_>, _>>()?;
        info!(
            "Loaded {} samples at {}Hz from {}",
            samples.len(),
            spec.sample_rate,
            path.display()
        );

        Ok(Self {
            path,
            sample_rate: spec.sample_rate,
            samples: Arc::new(samples),
            chunk_duration: Duration::from_millis(CHUNK_DURATION_MS),
            task: None,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn with_chunk_duration(mut self, chunk_duration: Duration) -> Self {
        self.chunk_duration = chunk_duration;
        self
    }

    fn samples_per_chunk(&self) -> usize {
        ((self.sample_rate as f64 * self.chunk_duration.as_secs_f64()) as usize).max(1)
    }
}

impl CaptureSource for WavFileSource {
    fn subscribe(&mut self) -> Result<mpsc::Receiver<String>> {
        self.unsubscribe();

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let samples = self.samples.clone();
        let per_chunk = self.samples_per_chunk();
        let period = self.chunk_duration;
        let path = self.path.clone();

        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut sent = 0usize;
            for chunk in samples.chunks(per_chunk) {
                ticker.tick().await;
                let bytes: Vec<u8> = chunk.iter().flat_map(|s| s.to_le_bytes()).collect();
                if tx.send(general_purpose::STANDARD.encode(bytes)).await.is_err() {
                    debug!("Capture receiver dropped after {} chunks", sent);
                    return;
                }
                sent += 1;
            }
            info!("Finished replaying {} ({} chunks)", path.display(), sent);
        }));

        Ok(rx)
    }

    fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for WavFileSource {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
