//! Storage-backed domain services.
//!
//! ARCHITECTURE
//! ============
//! Service modules own persistence and business rules so the dispatcher
//! can stay focused on protocol translation. Every fallible operation
//! returns an explicit `Result`; "not found" is an `Option`, never an
//! error thrown for control flow.

pub mod audit;
pub mod conversations;
pub mod friends;
pub mod messages;
pub mod users;
