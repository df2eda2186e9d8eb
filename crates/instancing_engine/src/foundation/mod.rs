//! Foundation module - Core utilities and types
//!
//! This module provides fundamental utilities used throughout the engine:
//! - Math types and operations
//! - Collections and handle types
//! - Logging utilities

pub mod collections;
pub mod logging;
pub mod math;
