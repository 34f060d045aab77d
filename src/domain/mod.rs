//! Domain layer - pure business logic with no runtime dependencies.
//!
//! This layer contains the core concepts and invariants of the registry:
//! - Service records and their validation
//! - Service events delivered to watchers
//! - Aggregate registry health
//! - Admission algorithms for rate limiting
//!
//! All types in this layer are pure and easily testable.

pub mod algorithm;
pub mod event;
pub mod health;
pub mod service;
