//! Infrastructure layer for cross-cutting concerns.
//!
//! Error handling and result types shared by the domain, service and
//! pipeline layers.

pub mod error;
