//! Utility functions shared by the service binary and background tasks.

pub mod bootstrap;
pub mod retry;
