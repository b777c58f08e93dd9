//! Error types for the BLE session manager.
//!
//! [`SessionError`] is the domain error surfaced to callers and subscribers,
//! [`TransportError`] wraps failures reported by the radio stack, and
//! [`Error`] covers everything the binary can fail on at startup.

use smol_str::{SmolStr, ToSmolStr};
use thiserror::Error;

use crate::bluetooth::transport::PeripheralId;

/// Failure reported by a transport operation.
///
/// The platform error is flattened to its message so that it can travel
/// inside cloneable session events.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TransportError(SmolStr);

impl TransportError {
   pub fn new(message: impl Into<SmolStr>) -> Self {
      Self(message.into())
   }
}

impl From<bluer::Error> for TransportError {
   fn from(e: bluer::Error) -> Self {
      Self(e.to_smolstr())
   }
}

/// Errors produced by session operations and reported on the event stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
   #[error("Unknown device: {0}")]
   UnknownDevice(PeripheralId),

   #[error("Connection failed: {0}")]
   ConnectionFailed(TransportError),

   #[error("No writable characteristic on connected device")]
   NoWritableCharacteristic,

   #[error("Not connected")]
   NotConnected,

   #[error("Write failed: {0}")]
   WriteFailed(TransportError),

   #[error("RSSI read failed: {0}")]
   RssiRead(TransportError),

   #[error("Service discovery failed: {0}")]
   DiscoveryFailed(TransportError),

   #[error("Scan failed: {0}")]
   ScanFailed(TransportError),

   #[error("Session busy with another connection")]
   Busy,

   #[error("Refusing to send an empty payload")]
   EmptyPayload,

   #[error("Connection lost")]
   ConnectionLost,

   #[error("Session manager has been shut down")]
   ManagerShutdown,
}

/// Main error type for the service binary.
#[derive(Error, Debug)]
pub enum Error {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error(transparent)]
   Session(#[from] SessionError),
}

/// Convenience type alias for Results with [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
