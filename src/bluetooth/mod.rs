//! Bluetooth communication layer.
//!
//! [`transport`] defines the callback-style seam the session drives;
//! [`bluez`] implements it on top of the system's BlueZ daemon.

pub mod bluez;
pub mod transport;
