//! Tutoring Simulator Library Crate
//!
//! Environment configuration, command-line arguments, input loading and the
//! end-to-end pipeline that drives `tutorsim-core`. The `simulate` binary is a
//! thin wrapper around this library.

pub mod cli;
pub mod config;
pub mod loaders;
pub mod output;
pub mod pipeline;
