//! `Tapedeck` - record/replay service virtualization server
//!
//! Calls that match a recorded chapter are replayed, optionally rewritten
//! by P4 scripts. Unmatched calls are forwarded to the live backend and
//! recorded as new chapters.

pub mod bounds;
pub mod cli;
pub mod config;
pub mod error;
pub mod gate;
pub mod matcher;
pub mod model;
pub mod observability;
pub mod p4;
pub mod processor;
pub mod replay;
pub mod server;
pub mod tape;
