//! `fanconctl` — thin RPC-client CLI for the fancond fan-control daemon
//! (spec §6 "CLI surface (for reference only, not core)").

pub mod args;
pub mod client;
pub mod commands;
