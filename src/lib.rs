//! A TFTP (RFC 1350) protocol engine with RFC 2347-2349 option negotiation:
//! wire codec, option negotiation, the client/server state machine, a
//! blocking client driver and a single-threaded, readiness-multiplexed
//! server dispatcher.

pub mod cli;
pub mod client;
pub mod consts;
pub mod context;
pub mod error;
pub mod fileio;
pub mod metrics;
pub mod options;
pub mod packet;
pub mod server;
pub mod state;

pub use error::{ErrorCode, Result, TftpError};
pub use packet::{Mode, Packet};
