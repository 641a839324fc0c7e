//! Job orchestration: backend selection, bounded retry with one-shot
//! fallback, and output placement on disk.

pub mod backends;
pub mod generator;
pub mod output;
pub mod retry;
