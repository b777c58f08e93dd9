//! BLE central session manager.
//!
//! Scans for peripherals, keeps a registry of what was seen, and manages one
//! connection at a time: writable characteristic discovery, acknowledged
//! writes and periodic RSSI polling.

pub mod bluetooth;
pub mod config;
pub mod console;
pub mod error;
pub mod event;
pub mod session;
