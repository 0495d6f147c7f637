//! Model audio output: decoding, scheduling and sinks

pub mod pcm;
pub mod scheduler;
pub mod sink;
pub mod taps;
pub mod wav_sink;

pub use pcm::{decode_pcm16, split_frames, AudioFrame};
pub use scheduler::PlaybackScheduler;
pub use sink::{ManualSink, OutputSink, UnitId};
pub use taps::{FrameTap, TapRegistry, VolumeMeter};
pub use wav_sink::WavSink;
