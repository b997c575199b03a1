//! # Connection Sources
//!
//! Reference-counted sharing of physical broker connections. Every endpoint
//! that names the same connection factory gets the same
//! [`ConnectionSource`]; the source tracks how many endpoints hold it and
//! tears down shared resources only when the last one closes.

pub mod connection_source;
pub mod registry;

pub use connection_source::{ConnectionSource, SessionHandle};
pub use registry::ConnectionSourceRegistry;
