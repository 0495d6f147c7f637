//! Output audio sink abstraction and an explicitly clocked implementation.

use std::sync::Arc;

use super::pcm::AudioFrame;

/// Handle of one playable unit bound to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u64);

/// The device side of playback: a monotonic clock, bindable playable units
/// with a start time, and a per-unit "finished" notification.
pub trait OutputSink: Send {
    /// Output clock in seconds. Monotonic.
    fn now(&self) -> f64;

    /// Bind `frame` to the current output stage, starting at `at` seconds.
    fn start(&mut self, frame: Arc<AudioFrame>, at: f64) -> UnitId;

    /// Set the gain of the current stage immediately.
    fn set_gain(&mut self, gain: f32);

    /// Ramp the gain of the current stage linearly to `target` over `over` seconds.
    fn ramp_gain(&mut self, target: f32, over: f64);

    /// Detach the current stage (cutting off anything bound to it) and
    /// replace it with a fresh full-gain one.
    fn rebuild_stage(&mut self);

    /// Units that finished playing since the last call, in finishing order.
    fn take_finished(&mut self) -> Vec<UnitId>;
}

/// Gain automation of one output stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageGain {
    /// `(time, gain)` anchors; between anchors the gain is interpolated
    /// linearly, after the last one it holds.
    anchors: Vec<(f64, f32)>,
    /// Time at which the stage was detached, if it was
    pub detached_at: Option<f64>,
}

impl StageGain {
    pub fn new(created_at: f64) -> Self {
        Self {
            anchors: vec![(created_at, 1.0)],
            detached_at: None,
        }
    }

    pub fn gain_at(&self, t: f64) -> f32 {
        if let Some(detached) = self.detached_at {
            if t >= detached {
                return 0.0;
            }
        }
        let mut prev = self.anchors[0];
        for &(time, gain) in &self.anchors {
            if t < time {
                if time <= prev.0 {
                    return prev.1;
                }
                let frac = ((t - prev.0) / (time - prev.0)) as f32;
                return prev.1 + (gain - prev.1) * frac.clamp(0.0, 1.0);
            }
            prev = (time, gain);
        }
        prev.1
    }

    /// Drop automation later than `t` and pin the value at `t`.
    fn pin(&mut self, t: f64) -> f32 {
        let current = self.gain_at(t);
        self.anchors.retain(|(time, _)| *time <= t);
        self.anchors.push((t, current));
        current
    }

    pub fn set(&mut self, t: f64, gain: f32) {
        self.pin(t);
        self.anchors.push((t, gain));
    }

    pub fn ramp(&mut self, t: f64, target: f32, over: f64) {
        self.pin(t);
        self.anchors.push((t + over.max(0.0), target));
    }
}

/// A unit bound to a sink.
#[derive(Debug, Clone)]
pub struct BoundUnit {
    pub id: UnitId,
    pub frame: Arc<AudioFrame>,
    pub start: f64,
    pub stage: usize,
}

impl BoundUnit {
    pub fn end(&self) -> f64 {
        self.start + self.frame.duration()
    }
}

/// Bookkeeping shared by sinks: stages, bound units and finish tracking.
#[derive(Debug, Default)]
pub struct UnitBook {
    next_id: u64,
    pub units: Vec<BoundUnit>,
    pub stages: Vec<StageGain>,
    pending: Vec<usize>,
}

impl UnitBook {
    pub fn new(now: f64) -> Self {
        Self {
            stages: vec![StageGain::new(now)],
            ..Default::default()
        }
    }

    pub fn current_stage(&mut self) -> &mut StageGain {
        let last = self.stages.len() - 1;
        &mut self.stages[last]
    }

    pub fn bind(&mut self, frame: Arc<AudioFrame>, at: f64) -> UnitId {
        let id = UnitId(self.next_id);
        self.next_id += 1;
        self.units.push(BoundUnit {
            id,
            frame,
            start: at,
            stage: self.stages.len() - 1,
        });
        self.pending.push(self.units.len() - 1);
        id
    }

    pub fn rebuild(&mut self, now: f64) {
        self.current_stage().detached_at = Some(now);
        self.stages.push(StageGain::new(now));
    }

    /// Units whose end time is `<= now`, ordered by end time.
    pub fn finished(&mut self, now: f64) -> Vec<UnitId> {
        let mut done: Vec<usize> = Vec::new();
        self.pending.retain(|&idx| {
            if self.units[idx].end() <= now {
                done.push(idx);
                false
            } else {
                true
            }
        });
        done.sort_by(|a, b| {
            self.units[*a]
                .end()
                .total_cmp(&self.units[*b].end())
                .then(a.cmp(b))
        });
        done.into_iter().map(|idx| self.units[idx].id).collect()
    }
}

/// Sink whose clock only moves when told to. Used for offline rendering
/// checks and deterministic tests.
#[derive(Debug)]
pub struct ManualSink {
    now: f64,
    pub book: UnitBook,
}

impl Default for ManualSink {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualSink {
    pub fn new() -> Self {
        Self {
            now: 0.0,
            book: UnitBook::new(0.0),
        }
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&mut self, secs: f64) {
        self.now += secs.max(0.0);
    }

    /// Move the clock to `t` if it lies in the future.
    pub fn advance_to(&mut self, t: f64) {
        if t > self.now {
            self.now = t;
        }
    }

    pub fn units(&self) -> &[BoundUnit] {
        &self.book.units
    }

    pub fn stage_count(&self) -> usize {
        self.book.stages.len()
    }

    pub fn gain_at(&self, t: f64) -> f32 {
        self.book.stages[self.book.stages.len() - 1].gain_at(t)
    }
}

impl OutputSink for ManualSink {
    fn now(&self) -> f64 {
        self.now
    }

    fn start(&mut self, frame: Arc<AudioFrame>, at: f64) -> UnitId {
        self.book.bind(frame, at)
    }

    fn set_gain(&mut self, gain: f32) {
        let now = self.now;
        self.book.current_stage().set(now, gain);
    }

    fn ramp_gain(&mut self, target: f32, over: f64) {
        let now = self.now;
        self.book.current_stage().ramp(now, target, over);
    }

    fn rebuild_stage(&mut self) {
        self.book.rebuild(self.now);
    }

    fn take_finished(&mut self) -> Vec<UnitId> {
        self.book.finished(self.now)
    }
}
