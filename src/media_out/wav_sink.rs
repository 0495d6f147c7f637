//! Output sink that renders the scheduled timeline into a WAV file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use super::pcm::{to_i16, AudioFrame};
use super::sink::{OutputSink, UnitBook, UnitId};
use crate::error::Result;

#[derive(Debug)]
enum SinkClock {
    Wall(Instant),
    Manual(f64),
}

/// Mixes every bound unit at its start offset (with stage gain automation
/// applied) and writes 16-bit mono PCM on [`WavSink::finish`].
#[derive(Debug)]
pub struct WavSink {
    path: PathBuf,
    sample_rate: u32,
    clock: SinkClock,
    book: UnitBook,
}

impl WavSink {
    /// Sink driven by the wall clock, for live sessions.
    pub fn new(path: impl AsRef<Path>, sample_rate: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            sample_rate,
            clock: SinkClock::Wall(Instant::now()),
            book: UnitBook::new(0.0),
        }
    }

    /// Sink whose clock moves only through [`WavSink::advance_to`], for
    /// offline rendering.
    pub fn offline(path: impl AsRef<Path>, sample_rate: u32) -> Self {
        Self {
            clock: SinkClock::Manual(0.0),
            ..Self::new(path, sample_rate)
        }
    }

    pub fn advance_to(&mut self, t: f64) {
        if let SinkClock::Manual(now) = &mut self.clock {
            if t > *now {
                *now = t;
            }
        }
    }

    /// Render the mixed timeline.
    pub fn render(&self) -> Vec<f32> {
        let rate = self.sample_rate as f64;
        let end = self.book.units.iter().map(|u| u.end()).fold(0.0, f64::max);
        let mut out = vec![0.0f32; (end * rate).ceil() as usize];

        for unit in &self.book.units {
            let stage = &self.book.stages[unit.stage];
            let offset = (unit.start * rate).round() as usize;
            for (i, sample) in unit.frame.samples().iter().enumerate() {
                let t = unit.start + i as f64 / rate;
                let gain = stage.gain_at(t);
                if gain == 0.0 {
                    continue;
                }
                if let Some(slot) = out.get_mut(offset + i) {
                    *slot += sample * gain;
                }
            }
        }
        out
    }

    /// Write the rendered timeline and return its path.
    pub fn finish(&self) -> Result<PathBuf> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let samples = self.render();
        let mut writer = hound::WavWriter::create(&self.path, spec)?;
        for sample in &samples {
            writer.write_sample(to_i16(*sample))?;
        }
        writer.finalize()?;
        info!(
            "💾 Wrote {:.2}s of playback ({} units) to {}",
            samples.len() as f64 / self.sample_rate as f64,
            self.book.units.len(),
            self.path.display()
        );
        Ok(self.path.clone())
    }
}

impl OutputSink for WavSink {
    fn now(&self) -> f64 {
        match &self.clock {
            SinkClock::Wall(epoch) => epoch.elapsed().as_secs_f64(),
            SinkClock::Manual(now) => *now,
        }
    }

    fn start(&mut self, frame: Arc<AudioFrame>, at: f64) -> UnitId {
        self.book.bind(frame, at)
    }

    fn set_gain(&mut self, gain: f32) {
        let now = self.now();
        self.book.current_stage().set(now, gain);
    }

    fn ramp_gain(&mut self, target: f32, over: f64) {
        let now = self.now();
        self.book.current_stage().ramp(now, target, over);
    }

    fn rebuild_stage(&mut self) {
        let now = self.now();
        self.book.rebuild(now);
    }

    fn take_finished(&mut self) -> Vec<UnitId> {
        let now = self.now();
        self.book.finished(now)
    }
}
