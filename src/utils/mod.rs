//! Shared utilities.

pub mod decimal;
