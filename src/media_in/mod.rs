//! Microphone-side input: sources of base64 PCM chunks for the relay

pub mod wav_source;

pub use wav_source::WavFileSource;

use tokio::sync::mpsc;

use crate::error::Result;

/// A capture source the session subscribes to while it may send audio.
///
/// Chunks are raw 16-bit little-endian PCM, base64 encoded. The receiver
/// closes when the source runs dry or after `unsubscribe`.
pub trait CaptureSource: Send {
    fn subscribe(&mut self) -> Result<mpsc::Receiver<String>>;

    fn unsubscribe(&mut self);
}
