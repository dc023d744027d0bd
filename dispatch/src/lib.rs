//! Master/worker distribution layer for the restoration pipeline.
//!
//! Frames the wire protocol (1-byte command, 8-byte little-endian length,
//! payload), negotiates endianness per connection, runs the master's job
//! table and accept loop, and the worker's fetch/solve/deliver loop with
//! its reconnection back-off.

pub mod host;
pub mod master;
pub mod protocol;
pub mod transport;
pub mod worker;

pub use host::{HostInfo, HostStatus};
pub use master::{Master, SourceFactory};
pub use protocol::{Command, ProtocolError};
pub use transport::{Connection, Frame};
pub use worker::Worker;
