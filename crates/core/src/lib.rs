//! Core library for simulated tutoring dialogues.
//!
//! Holds the concurrent batch machinery (rate-limited dispatch to a language
//! model), concept graphs and their construction, knowledge-state
//! initialization, gating and per-turn updates, and the round-synchronous
//! conversation engine that ties them together. The simulator service is a
//! thin orchestration layer over this crate.

pub mod call_log;
pub mod concept;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod gate;
pub mod graph_builder;
pub mod initializer;
pub mod json;
pub mod knowledge;
pub mod length_control;
pub mod llm_client;
pub mod profile;
pub mod prompts;
pub mod rate_limit;
pub mod updater;

pub use error::{BackendError, CoreError, CoreResult};
