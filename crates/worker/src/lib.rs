//! Batch processing: the concurrent queue scheduler, folder discovery,
//! diagnostics and the command-line front end.

pub mod cli;
pub mod diagnostics;
pub mod events;
pub mod folder;
pub mod scheduler;
