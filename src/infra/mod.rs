//! Infrastructure layer
//!
//! Handles all I/O: host device enumeration, serial ports, the flashing
//! utility and the filesystem. This module is the only place where side
//! effects occur.

pub mod artifacts;
pub mod dirs;
pub mod filesystem;
pub mod monitor;
pub mod reconnect;
pub mod serial;
pub mod upload;
