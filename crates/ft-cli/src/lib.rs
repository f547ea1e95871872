//! flaretun: Command-line interface for cloudflared tunnels
//!
//! Provides the `flaretun` CLI for creating tunnels, registering the local
//! services they expose, and running the daemon with a generated config.

pub mod commands;
pub mod context;
pub mod output;
