//! # Shared Types Crate
//!
//! This crate contains the domain entities shared across all gateway
//! subsystems: object hashes, short transaction ids, connection identities,
//! the cooperative alarm queue, and the expiring collections used for
//! time-bounded caches.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: All cross-subsystem types are defined here.
//! - **No hidden clocks**: every time-dependent operation takes `now` as an
//!   argument so services stay deterministic under test.

pub mod alarm;
pub mod entities;
pub mod errors;
pub mod expiring;

pub use alarm::{AlarmId, AlarmQueue};
pub use entities::*;
pub use errors::GatewayError;
pub use expiring::{ExpiringDict, ExpiringSet};
