//! API handlers organized by domain.

pub mod basic;
pub mod extensions;
pub mod storage;

pub use basic::health_handler;
