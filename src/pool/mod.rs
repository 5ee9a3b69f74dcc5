//! Connection pool core
//!
//! This module provides:
//! - Reference-counted connection handles keyed by endpoint id
//! - A connection factory with first-contact and subsequent retry tiers
//! - A background reaper evicting unreferenced, idle handles
//! - Immediate invalidation of connections reported as broken

mod reaper;

pub mod clock;
pub mod connection;
pub mod error;
pub mod factory;
pub mod handle;

pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{ConnectionPool, PoolConfig, PoolStats};
pub use error::{DialError, FactoryError, PoolError};
pub use factory::{ConnectionFactory, Dial, FactoryConfig, RetryTier};
pub use handle::ConnectionHandle;
