//! # Audio Processing Module
//!
//! Everything the bridge does to audio samples, with no I/O and no per-call state.
//!
//! ## Key Components:
//! - **PCM encoding** (`buffer`): sample arrays, little-endian bytes, base64 payloads
//! - **Sample-rate conversion** (`resampler`): 8kHz <-> 24kHz windowed-sinc
//!   resampling plus edge fades against boundary clicks
//!
//! ## Audio Format:
//! - **Encoding**: signed 16-bit PCM, little-endian on the wire
//! - **Channels**: mono
//! - **Rates**: 8kHz (telephony) and 24kHz (speech agent), nothing else

pub mod buffer;       // PCM representation changes
pub mod resampler;    // Rate conversion and fades

pub use resampler::{ResamplerConfig, SampleRateConverter};
