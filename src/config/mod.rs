//! Configuration constants
//!
//! - [`defaults`] - Default values for station settings and profiles

pub mod defaults;
