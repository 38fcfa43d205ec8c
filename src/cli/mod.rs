//! Command-line interface for apply_forge.
//!
//! Provides commands for running the pipeline, inspecting run status and
//! collaborator health, and managing checkpoints.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
