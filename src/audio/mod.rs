//! Audio codec utilities
//!
//! G.711 companded PCM conversion between A-law and μ-law, plus expansion
//! to 16-bit linear PCM for the transcription path. Both call legs are
//! fixed at 8-bit companded, 8 kHz, mono; no resampling or channel mixing
//! happens here.

mod g711;

pub use g711::{
    CompandingLaw, alaw_to_linear, alaw_to_mulaw, expand_to_linear16, mulaw_to_alaw,
    mulaw_to_linear, to_other_law, transcode_frame,
};
