//! devops-agent: watches local log files for error patterns and asks a
//! language model for a diagnosis.
//!
//! The core is [`monitor::engine::MonitorLoop`]; everything else is
//! configuration, the model provider, and the one-shot CLI helpers.
//!
//! See `DESIGN.md` for the architecture notes.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod credentials;
pub mod logging;
pub mod monitor;
pub mod prompts;
pub mod providers;
pub mod setup;
