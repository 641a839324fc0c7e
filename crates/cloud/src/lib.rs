//! fal.ai remote queue backend.
//!
//! The source image is staged on a public image host, submitted to the
//! fal.ai outpaint queue, polled on an escalating schedule and the result
//! images downloaded.

pub mod adapter;
pub mod hosting;
pub mod poll;
pub mod queue;
