//! Shared foundation types for the Medulla platform
//!
//! This crate provides the building blocks every other Medulla component
//! consumes:
//! - Fleet host identity with authentication references
//! - A clock abstraction so time-dependent logic is testable

#![warn(missing_docs)]

pub mod clock;
pub mod host;

pub use clock::{Clock, ManualClock, SystemClock};
pub use host::{AuthMethod, Host};
