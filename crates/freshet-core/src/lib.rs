//! # Freshet Core
//!
//! Foundational types for the Freshet streaming engine.
//!
//! This crate provides the data structures shared by every Freshet component:
//!
//! - [`Value`]: the dynamically-typed runtime value carried in event payloads
//!   and materialized views
//! - [`time`]: millisecond-precision event-time helpers used by the window
//!   arithmetic
//!
//! It deliberately contains no processing logic; the engine lives in
//! `freshet-engine`.

pub mod time;
pub mod value;

pub use time::TimestampMs;
pub use value::Value;
