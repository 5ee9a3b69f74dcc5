//! handlepool - shared, reference-counted connections keyed by endpoint id
//!
//! A [`ConnectionPool`] hands out one [`ConnectionHandle`] per endpoint id,
//! dialing it through a [`ConnectionFactory`] with first-contact and
//! subsequent retry tiers, and evicts handles that nobody holds once they
//! have been idle past the linger time.

pub mod cli;
pub mod config;
pub mod dial;
pub mod pool;

pub use config::Config;
pub use pool::{ConnectionFactory, ConnectionHandle, ConnectionPool, Dial, PoolConfig, PoolError};
