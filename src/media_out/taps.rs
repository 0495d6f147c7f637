//! Per-session registry of auxiliary processing taps.
//!
//! Every frame the scheduler binds to the output is also offered to each
//! registered tap, together with its start time on the output clock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::pcm::AudioFrame;

/// Observer of scheduled output frames.
pub trait FrameTap: Send {
    fn on_frame(&mut self, frame: &AudioFrame, start_at: f64);
}

impl<F> FrameTap for F
where
    F: FnMut(&AudioFrame, f64) + Send,
{
    fn on_frame(&mut self, frame: &AudioFrame, start_at: f64) {
        self(frame, start_at)
    }
}

/// Named taps, each with one or more handlers. Cloning yields another handle
/// to the same registry.
#[derive(Clone, Default)]
pub struct TapRegistry {
    inner: Arc<Mutex<BTreeMap<String, Vec<Box<dyn FrameTap>>>>>,
}

impl std::fmt::Debug for TapRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapRegistry").field("names", &self.names()).finish()
    }
}

impl TapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`. An existing name gets the handler
    /// appended rather than replaced.
    pub fn register(&self, name: &str, tap: Box<dyn FrameTap>) {
        match self.inner.lock() {
            Ok(mut taps) => {
                let handlers = taps.entry(name.to_string()).or_default();
                handlers.push(tap);
                debug!("Registered tap '{}' ({} handler(s))", name, handlers.len());
            }
            Err(_) => warn!("Tap registry poisoned; dropping tap '{}'", name),
        }
    }

    /// Remove every handler registered under `name`. Returns whether the name existed.
    pub fn unregister(&self, name: &str) -> bool {
        self.inner
            .lock()
            .map(|mut taps| taps.remove(name).is_some())
            .unwrap_or(false)
    }

    pub fn names(&self) -> Vec<String> {
        self.inner
            .lock()
            .map(|taps| taps.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map(|taps| taps.is_empty()).unwrap_or(true)
    }

    /// Offer a scheduled frame to every handler.
    pub fn offer(&self, frame: &AudioFrame, start_at: f64) {
        if let Ok(mut taps) = self.inner.lock() {
            for handlers in taps.values_mut() {
                for handler in handlers.iter_mut() {
                    handler.on_frame(frame, start_at);
                }
            }
        }
    }
}

/// Tap reporting the RMS level of each scheduled frame.
pub struct VolumeMeter {
    tx: watch::Sender<f32>,
}

impl VolumeMeter {
    /// Create a meter and the receiver its levels are published on.
    pub fn new() -> (Self, watch::Receiver<f32>) {
        let (tx, rx) = watch::channel(0.0);
        (Self { tx }, rx)
    }
}

impl FrameTap for VolumeMeter {
    fn on_frame(&mut self, frame: &AudioFrame, _start_at: f64) {
        let _ = self.tx.send(rms(frame.samples()));
    }
}

pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|s| s * s).sum();
    (sum / samples.len() as f32).sqrt()
}
