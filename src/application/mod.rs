//! Application layer - orchestration of domain logic.
//!
//! This layer coordinates the domain logic and manages the runtime behavior:
//! - Service registry (records, heartbeats, watchers)
//! - Heartbeat checker (background eviction)
//! - Rate limiters and their keyed manager
//! - Circuit breakers and their keyed manager
//! - Admission controller composing all of the above
//!
//! ## Ports
//!
//! The application layer defines ports (traits) that infrastructure
//! adapters must implement. This keeps the application layer independent
//! from infrastructure details.

pub mod admission;
pub mod breaker_manager;
pub mod circuit_breaker;
pub mod heartbeat;
pub mod limiter;
pub mod limiter_manager;
pub mod metrics;
pub mod ports;
pub mod registry;
