//! Jitter-absorbing playback engine.
//!
//! Inbound PCM16 chunks are decoded, sliced into fixed frames and queued.
//! A scheduling pass binds queued frames to the sink no further than the
//! schedule-ahead window past the output clock, so irregular network
//! delivery never opens a gap between consecutive frames.
//!
//! The engine never sleeps itself. Its timers (idle poll, pre-wake,
//! tail-finish check, stage rebuild) are deadlines on the sink clock exposed
//! through [`PlaybackScheduler::next_deadline`]; the driver calls
//! [`PlaybackScheduler::on_timer`] when one is due.

use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, info, trace};

use super::pcm::{decode_pcm16, split_frames, AudioFrame};
use super::sink::{OutputSink, UnitId};
use super::taps::TapRegistry;
use crate::config::PlaybackConfig;
use crate::events::PlaybackEvent;

/// Last frame scheduled while the queue ran empty.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Tail {
    unit: UnitId,
    ends_at: f64,
}

pub struct PlaybackScheduler<S: OutputSink> {
    config: PlaybackConfig,
    sink: S,
    taps: TapRegistry,
    queue: VecDeque<Arc<AudioFrame>>,
    /// Earliest free instant on the output timeline
    scheduled_clock: f64,
    playing: bool,
    stream_complete: bool,
    tail: Option<Tail>,
    idle_poll_at: Option<f64>,
    pre_wake_at: Option<f64>,
    stage_rebuild_at: Option<f64>,
    events: Vec<PlaybackEvent>,
}

impl<S: OutputSink> PlaybackScheduler<S> {
    pub fn new(config: PlaybackConfig, sink: S) -> Self {
        Self::with_taps(config, sink, TapRegistry::new())
    }

    /// Create a scheduler that offers every scheduled frame to `taps`.
    pub fn with_taps(config: PlaybackConfig, sink: S, taps: TapRegistry) -> Self {
        let scheduled_clock = sink.now();
        Self {
            config,
            sink,
            taps,
            queue: VecDeque::new(),
            scheduled_clock,
            playing: false,
            stream_complete: false,
            tail: None,
            idle_poll_at: None,
            pre_wake_at: None,
            stage_rebuild_at: None,
            events: Vec::new(),
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn is_stream_complete(&self) -> bool {
        self.stream_complete
    }

    pub fn queued_frames(&self) -> usize {
        self.queue.len()
    }

    pub fn scheduled_clock(&self) -> f64 {
        self.scheduled_clock
    }

    /// Drain pending notifications.
    pub fn drain_events(&mut self) -> Vec<PlaybackEvent> {
        std::mem::take(&mut self.events)
    }

    /// Decode a PCM16 chunk, queue its frames and start playback if idle.
    pub fn add_chunk(&mut self, bytes: &[u8]) {
        let samples = decode_pcm16(bytes);
        let frames = split_frames(&samples, self.config.frame_samples, self.config.sample_rate);
        debug!(
            "Queued {} frame(s) from {} byte chunk ({} already queued)",
            frames.len(),
            bytes.len(),
            self.queue.len()
        );
        self.stream_complete = false;
        self.queue.extend(frames);

        if !self.playing {
            if self.stage_rebuild_at.take().is_some() {
                // Fresh audio must not land on the stage being faded out.
                self.sink.rebuild_stage();
            }
            let now = self.sink.now();
            self.scheduled_clock = self.scheduled_clock.max(now + secs(self.config.initial_buffer));
            self.playing = true;
            info!("▶️ Starting playback at {:.3}s", self.scheduled_clock);
            self.schedule_pass();
        }
    }

    /// Bind queued frames inside the schedule-ahead window, then arm the
    /// next wake-up.
    fn schedule_pass(&mut self) {
        let now = self.sink.now();
        let horizon = now + secs(self.config.schedule_ahead);

        while self.scheduled_clock < horizon {
            let Some(frame) = self.queue.pop_front() else {
                break;
            };
            let start = self.scheduled_clock.max(now);
            let unit = self.sink.start(frame.clone(), start);
            self.taps.offer(&frame, start);
            self.scheduled_clock = start + frame.duration();
            trace!(
                "Scheduled {:?} ({} samples) at {:.3}s, clock now {:.3}s",
                unit,
                frame.len(),
                start,
                self.scheduled_clock
            );

            if self.queue.is_empty() {
                self.tail = Some(Tail {
                    unit,
                    ends_at: self.scheduled_clock,
                });
            }
        }

        if self.queue.is_empty() {
            self.pre_wake_at = None;
            if self.stream_complete {
                self.playing = false;
                self.idle_poll_at = None;
            } else if self.idle_poll_at.is_none() {
                self.idle_poll_at = Some(now + secs(self.config.idle_poll));
            }
        } else {
            let lead = secs(self.config.pre_wake_lead);
            let delay = (self.scheduled_clock - now - lead).max(0.0);
            self.pre_wake_at = Some(now + delay);
        }
    }

    /// Earliest pending timer on the sink clock.
    pub fn next_deadline(&self) -> Option<f64> {
        [
            self.pre_wake_at,
            self.idle_poll_at,
            self.stage_rebuild_at,
            self.tail.map(|t| t.ends_at),
        ]
        .into_iter()
        .flatten()
        .reduce(f64::min)
    }

    /// Fire every timer that is due and collect finished notifications.
    pub fn on_timer(&mut self) {
        self.poll_finished();
        let now = self.sink.now();

        if self.stage_rebuild_at.is_some_and(|t| t <= now) {
            self.stage_rebuild_at = None;
            self.sink.rebuild_stage();
            debug!("Output stage rebuilt");
        }

        if self.pre_wake_at.is_some_and(|t| t <= now) {
            self.pre_wake_at = None;
            self.schedule_pass();
        }

        if self.idle_poll_at.is_some_and(|t| t <= now) {
            self.idle_poll_at = None;
            if !self.queue.is_empty() {
                self.schedule_pass();
            } else if self.stream_complete {
                self.playing = false;
            } else {
                self.idle_poll_at = Some(now + secs(self.config.idle_poll));
            }
        }
    }

    /// Handle "finished" notifications from the sink.
    pub fn poll_finished(&mut self) {
        for unit in self.sink.take_finished() {
            self.on_unit_finished(unit);
        }
    }

    fn on_unit_finished(&mut self, unit: UnitId) {
        match self.tail {
            Some(tail) if tail.unit == unit && self.queue.is_empty() => {
                self.tail = None;
                info!("Playback drained");
                self.events.push(PlaybackEvent::Complete);
            }
            Some(tail) if tail.unit == unit => {
                // More audio queued behind it; the next pass records a new tail.
                self.tail = None;
                trace!("{:?} finished with {} frame(s) queued", unit, self.queue.len());
            }
            _ => trace!("{:?} finished", unit),
        }
    }

    /// Cut playback: flush the queue, fade the current stage out and replace
    /// it with a fresh one once the fade is done.
    pub fn stop(&mut self) {
        let dropped = self.queue.len();
        self.queue.clear();
        self.idle_poll_at = None;
        self.pre_wake_at = None;

        let now = self.sink.now();
        self.scheduled_clock = now;
        self.sink.ramp_gain(0.0, secs(self.config.stop_ramp));
        self.stage_rebuild_at = Some(now + secs(self.config.stage_rebuild_delay));

        self.playing = false;
        self.stream_complete = true;
        info!("⏹️ Playback stopped ({} queued frame(s) dropped)", dropped);
    }

    /// Re-arm playback after `stop()`.
    pub fn resume(&mut self) {
        if self.stage_rebuild_at.take().is_some() {
            self.sink.rebuild_stage();
        }
        let now = self.sink.now();
        self.scheduled_clock = now + secs(self.config.initial_buffer);
        self.sink.set_gain(1.0);
        self.stream_complete = false;
        debug!("Playback resumed, clock reset to {:.3}s", self.scheduled_clock);
    }

    /// Mark the stream finished and notify completion right away.
    pub fn complete(&mut self) {
        self.stream_complete = true;
        self.events.push(PlaybackEvent::Complete);
    }
}

fn secs(d: std::time::Duration) -> f64 {
    d.as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_out::pcm::encode_pcm16;
    use crate::media_out::sink::ManualSink;
    use std::sync::Mutex;

    const EPS: f64 = 1e-9;

    fn scheduler() -> PlaybackScheduler<ManualSink> {
        PlaybackScheduler::new(PlaybackConfig::default(), ManualSink::new())
    }

    fn chunk(samples: usize) -> Vec<u8> {
        encode_pcm16(&vec![0.25; samples])
    }

    /// Advance the sink clock deadline by deadline, firing timers, until `until`.
    fn run_until(s: &mut PlaybackScheduler<ManualSink>, until: f64, clocks: &mut Vec<f64>) {
        while let Some(deadline) = s.next_deadline() {
            if deadline > until {
                break;
            }
            s.sink_mut().advance_to(deadline);
            s.on_timer();
            clocks.push(s.scheduled_clock());
        }
        s.sink_mut().advance_to(until);
        s.on_timer();
        clocks.push(s.scheduled_clock());
    }

    #[test]
    fn test_two_chunks_play_gapless_from_initial_buffer() {
        let mut s = scheduler();
        s.add_chunk(&chunk(10_000));
        s.add_chunk(&chunk(5_000));

        let mut clocks = vec![s.scheduled_clock()];
        run_until(&mut s, 2.0, &mut clocks);

        let units = s.sink().units();
        let lens: Vec<usize> = units.iter().map(|u| u.frame.len()).collect();
        assert_eq!(lens, vec![7680, 2320, 5000]);
        assert!((units[0].start - 0.1).abs() < EPS);
        for pair in units.windows(2) {
            assert!((pair[1].start - pair[0].end()).abs() < EPS, "gap between frames");
        }
        assert!(clocks.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn test_one_chunk_of_fifteen_thousand_samples() {
        let mut s = scheduler();
        s.add_chunk(&chunk(15_000));
        let mut clocks = Vec::new();
        run_until(&mut s, 1.0, &mut clocks);

        let lens: Vec<usize> = s.sink().units().iter().map(|u| u.frame.len()).collect();
        assert_eq!(lens, vec![7680, 7320]);
        assert!((s.sink().units()[1].start - (0.1 + 0.32)).abs() < EPS);
    }

    #[test]
    fn test_schedule_ahead_window_limits_binding() {
        let mut s = scheduler();
        // 4 full frames, 1.28 s of audio
        s.add_chunk(&chunk(7680 * 4));
        // clock 0.1 < 0.2 binds the first; 0.42 is outside the window
        assert_eq!(s.sink().units().len(), 1);
        assert_eq!(s.queued_frames(), 3);
        // pre-wake 50 ms before the clock reaches the end of the bound audio
        let deadline = s.next_deadline().unwrap();
        assert!((deadline - 0.37).abs() < EPS);

        s.sink_mut().advance_to(deadline);
        s.on_timer();
        assert_eq!(s.sink().units().len(), 2);
    }

    #[test]
    fn test_frames_never_start_in_the_past() {
        let mut s = scheduler();
        s.add_chunk(&chunk(2400)); // 100 ms
        // Deliver the next chunk long after the first one ran out.
        s.sink_mut().advance(1.0);
        s.on_timer();
        s.add_chunk(&chunk(2400));
        s.sink_mut().advance(0.15);
        s.on_timer();

        let units = s.sink().units();
        assert_eq!(units.len(), 2);
        assert!(units[1].start >= 1.0 - EPS);
    }

    #[test]
    fn test_monotonic_clock_under_jitter() {
        let mut s = scheduler();
        let mut clocks = vec![s.scheduled_clock()];
        let gaps = [0.0, 0.01, 0.3, 0.05, 0.7, 0.0, 0.12, 0.4];
        for (i, gap) in gaps.iter().enumerate() {
            let target = s.sink().now() + gap;
            run_until(&mut s, target, &mut clocks);
            s.add_chunk(&chunk(1000 + i * 1700));
            clocks.push(s.scheduled_clock());
        }
        run_until(&mut s, 10.0, &mut clocks);
        assert!(clocks.windows(2).all(|w| w[1] >= w[0] - EPS));
        assert_eq!(s.queued_frames(), 0);
    }

    #[test]
    fn test_completion_fires_once_on_natural_drain() {
        let mut s = scheduler();
        s.add_chunk(&chunk(2400));
        // Arrives before the first tail has played; becomes the new tail.
        s.sink_mut().advance(0.05);
        s.on_timer();
        s.add_chunk(&chunk(2400));
        s.sink_mut().advance(0.06);
        s.on_timer();

        let mut clocks = Vec::new();
        run_until(&mut s, 2.0, &mut clocks);
        assert_eq!(s.drain_events(), vec![PlaybackEvent::Complete]);
        assert!(s.drain_events().is_empty());
    }

    #[test]
    fn test_superseded_tail_does_not_complete() {
        let mut s = scheduler();
        s.add_chunk(&chunk(2400)); // plays 0.1..0.2 and is the tail
        let first_tail = s.tail.unwrap().unit;
        s.sink_mut().advance(0.12);
        s.add_chunk(&chunk(2400));
        // The idle poll binds the new frame, which becomes the tail.
        s.on_timer();
        s.sink_mut().advance_to(0.2);
        s.on_timer();
        s.sink_mut().advance_to(0.21);
        s.on_timer();

        assert_ne!(s.tail.map(|t| t.unit), Some(first_tail));
        assert!(s.drain_events().is_empty(), "old tail must not complete the stream");
    }

    #[test]
    fn test_tail_finishing_with_queued_audio_is_dropped() {
        let mut s = scheduler();
        s.add_chunk(&chunk(2400)); // 0.1..0.2
        s.sink_mut().advance(0.05);
        // Arrives before the idle poll fires.
        s.add_chunk(&chunk(2400));
        s.sink_mut().advance_to(0.2);
        s.poll_finished();

        assert!(s.tail.is_none());
        assert!(s.drain_events().is_empty());
        assert!(s.next_deadline().is_some_and(|t| t >= 0.1));

        s.on_timer();
        assert_eq!(s.queued_frames(), 0);
        let tail = s.tail.expect("new tail recorded");
        assert!((tail.ends_at - 0.3).abs() < EPS);
    }

    #[test]
    fn test_stop_flushes_and_fades() {
        let mut s = scheduler();
        s.add_chunk(&chunk(7680 * 3));
        s.sink_mut().advance(0.15);
        s.stop();

        assert_eq!(s.queued_frames(), 0);
        assert!(!s.is_playing());
        assert!(s.is_stream_complete());
        assert!((s.scheduled_clock() - 0.15).abs() < EPS);
        assert_eq!(s.sink().gain_at(0.15), 1.0);
        assert_eq!(s.sink().gain_at(0.3), 0.0);

        // Stage replaced after the rebuild delay; new stage is full gain.
        s.sink_mut().advance_to(0.4);
        s.on_timer();
        assert_eq!(s.sink().stage_count(), 2);
        assert_eq!(s.sink().gain_at(0.4), 1.0);
    }

    #[test]
    fn test_audio_after_stop_lands_on_fresh_stage() {
        let mut s = scheduler();
        s.add_chunk(&chunk(7680));
        s.sink_mut().advance(0.15);
        s.stop();
        s.sink_mut().advance(0.02);
        s.add_chunk(&chunk(2400));

        assert_eq!(s.sink().stage_count(), 2);
        let last = s.sink().units().last().unwrap();
        assert_eq!(last.stage, 1);
        assert!((last.start - 0.27).abs() < EPS);
        assert!(s.is_playing());
    }

    #[test]
    fn test_resume_resets_clock_and_gain() {
        let mut s = scheduler();
        s.add_chunk(&chunk(7680));
        s.stop();
        s.sink_mut().advance(0.05);
        s.resume();

        assert!(!s.is_stream_complete());
        assert!((s.scheduled_clock() - 0.15).abs() < EPS);
        assert_eq!(s.sink().gain_at(0.05), 1.0);
        assert_eq!(s.sink().stage_count(), 2);
    }

    #[test]
    fn test_complete_notifies_immediately() {
        let mut s = scheduler();
        s.complete();
        assert!(s.is_stream_complete());
        assert_eq!(s.drain_events(), vec![PlaybackEvent::Complete]);
    }

    #[test]
    fn test_idle_poll_stops_after_complete() {
        let mut s = scheduler();
        s.add_chunk(&chunk(2400));
        assert!(s.idle_poll_at.is_some());
        s.complete();
        let mut clocks = Vec::new();
        run_until(&mut s, 1.0, &mut clocks);
        assert!(!s.is_playing());
        assert!(s.idle_poll_at.is_none());
        assert!(s.next_deadline().is_none());
    }

    #[test]
    fn test_taps_see_every_scheduled_frame() {
        let taps = TapRegistry::new();
        let starts = Arc::new(Mutex::new(Vec::new()));
        let seen = starts.clone();
        taps.register(
            "starts",
            Box::new(move |_: &AudioFrame, at: f64| seen.lock().unwrap().push(at)),
        );

        let mut s = PlaybackScheduler::with_taps(PlaybackConfig::default(), ManualSink::new(), taps);
        s.add_chunk(&chunk(7680 * 2));
        let mut clocks = Vec::new();
        run_until(&mut s, 1.0, &mut clocks);

        let starts = starts.lock().unwrap();
        assert_eq!(starts.len(), 2);
        assert!((starts[1] - 0.42).abs() < EPS);
    }
}
