//! Concrete dial operations
//!
//! - [`TcpDialer`]: resolves `host:port` endpoint ids and opens a TCP stream
//! - [`FixedDialer`]: hands out a fixed in-process connection, with scripted failures

pub mod fixed;
pub mod tcp;

pub use fixed::FixedDialer;
pub use tcp::{TcpDialer, TcpDialerConfig};
