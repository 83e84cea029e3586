//! Batch transcription pipeline
//!
//! A decoupled sink for call audio: the relay feeds linear PCM per call
//! into the [`TranscriptionAccumulator`], which flushes on size or time
//! thresholds to a [`TranscriptionSink`]. Nothing in this module can fail
//! the live relay path: flush errors are contained, logged and retried.

mod accumulator;
mod sink;

pub use accumulator::{AccumulatorConfig, TranscriptionAccumulator};
pub use sink::{
    HttpTranscriptionSink, NullTranscriptionSink, TranscriptSegment, TranscriptionSink,
    wav_container,
};
