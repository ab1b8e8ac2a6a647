//! Command-line interface for ai3.
//!
//! One-shot orchestration of a prompt, optionally streaming run events as
//! JSON lines, plus a `--serve` mode exposing the HTTP surface.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli};
