//! soundcheck — validates that audio files decode cleanly end-to-end.
//!
//! Given files and directories, the engine filters to the supported
//! container formats (FLAC, MP3, WavPack, Ogg-Vorbis), streams every
//! matching file through the corresponding decoder on a pool of worker
//! threads, and aggregates per-file pass/fail results into a final
//! report. Nothing is played back or re-encoded; the only question asked
//! of each file is whether it decodes to the end without errors.

pub mod decoder;
pub mod engine;
pub mod error;
pub mod models;
pub mod report;
pub mod scanner;
pub mod stream;
