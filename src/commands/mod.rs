//! # Commands Module
//!
//! Command handlers behind the CLI subcommands:
//!
//! ## `serve`
//! Runs a storage node from a configuration file:
//! - Binds the TCP transport and dials the bootstrap nodes
//! - Serves store/get traffic and replicates to peers
//! - Shuts down gracefully on ctrl-c
//!
//! ## `demo`
//! Runs a self-contained three-node cluster on localhost:
//! - Stores a handful of files round-robin across the nodes
//! - Reads every file back from a different node than stored it
//! - Cleans up the temporary storage roots afterwards

pub mod demo;
pub mod serve;
