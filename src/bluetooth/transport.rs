//! Transport abstraction over the platform BLE stack.
//!
//! A [`Transport`] issues radio operations without blocking; every
//! completion, failure or unsolicited change comes back as a
//! [`TransportEvent`] through the [`TransportSink`] the transport was built
//! with.

use std::{fmt, sync::Arc};

use log::warn;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use smol_str::{SmolStr, ToSmolStr};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

/// Bytes written to a characteristic.
pub type Payload = SmallVec<[u8; 32]>;

/// Opaque peripheral handle; the BlueZ transport uses the device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeripheralId(SmolStr);

impl PeripheralId {
   pub fn new(id: impl Into<SmolStr>) -> Self {
      Self(id.into())
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }
}

impl fmt::Display for PeripheralId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.pad(&self.0)
   }
}

impl From<&str> for PeripheralId {
   fn from(id: &str) -> Self {
      Self::new(id)
   }
}

impl From<bluer::Address> for PeripheralId {
   fn from(address: bluer::Address) -> Self {
      Self(address.to_smolstr())
   }
}

/// GATT service handle on a connected peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ServiceId(pub u16);

/// GATT characteristic handle, scoped to its service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct CharacteristicId {
   pub service: ServiceId,
   pub handle: u16,
}

impl fmt::Display for CharacteristicId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "{:#06x}/{:#06x}", self.service.0, self.handle)
   }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProps {
   pub read: bool,
   pub write: bool,
   pub write_without_response: bool,
   pub notify: bool,
}

impl CharacteristicProps {
   /// True when the characteristic accepts writes in either mode.
   pub const fn is_writable(self) -> bool {
      self.write || self.write_without_response
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
   pub id: CharacteristicId,
   pub uuid: Uuid,
   pub props: CharacteristicProps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum WriteMode {
   #[strum(serialize = "with-response")]
   WithResponse,
   #[strum(serialize = "without-response")]
   WithoutResponse,
}

/// A single characteristic write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
   pub payload: Payload,
   pub mode: WriteMode,
}

impl OutboundMessage {
   pub fn acknowledged(payload: &[u8]) -> Self {
      Self {
         payload: Payload::from_slice(payload),
         mode: WriteMode::WithResponse,
      }
   }
}

/// Correlates an asynchronous operation (connection attempt, write or RSSI
/// read) with its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Ticket(pub u64);

impl fmt::Display for Ticket {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "#{}", self.0)
   }
}

/// Power/availability state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AdapterState {
   Unknown,
   Resetting,
   Unsupported,
   Unauthorized,
   PoweredOff,
   PoweredOn,
}

/// Everything a transport reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
   AdapterStateChanged(AdapterState),
   Discovered {
      id: PeripheralId,
      name: Option<SmolStr>,
      rssi: Option<i16>,
   },
   ScanFailed(TransportError),
   /// Link up for the connection attempt tagged `attempt`.
   Connected {
      id: PeripheralId,
      attempt: Ticket,
   },
   ConnectFailed {
      id: PeripheralId,
      attempt: Ticket,
      error: TransportError,
   },
   /// Link gone, requested or not; `error` is set when the stack reported one.
   Disconnected {
      id: PeripheralId,
      attempt: Ticket,
      error: Option<TransportError>,
   },
   ServicesDiscovered {
      id: PeripheralId,
      result: Result<Vec<ServiceId>, TransportError>,
   },
   CharacteristicsDiscovered {
      id: PeripheralId,
      service: ServiceId,
      result: Result<Vec<CharacteristicInfo>, TransportError>,
   },
   WriteCompleted {
      id: PeripheralId,
      ticket: Ticket,
      result: Result<(), TransportError>,
   },
   RssiRead {
      id: PeripheralId,
      ticket: Ticket,
      result: Result<i16, TransportError>,
   },
}

/// Non-blocking interface to a BLE central stack.
///
/// Implementations must return immediately and deliver the outcome of each
/// call as a [`TransportEvent`].
pub trait Transport: Send + Sync {
   /// Scans for all advertising peripherals, without a service filter.
   fn scan(&self);
   fn stop_scan(&self);
   /// Opens a link to `id`. Link events for it carry `attempt`.
   fn connect(&self, id: &PeripheralId, attempt: Ticket);
   fn disconnect(&self, id: &PeripheralId, attempt: Ticket);
   fn discover_services(&self, id: &PeripheralId);
   fn discover_characteristics(&self, id: &PeripheralId, service: ServiceId);
   fn write(
      &self,
      id: &PeripheralId,
      characteristic: CharacteristicId,
      message: OutboundMessage,
      ticket: Ticket,
   );
   fn read_rssi(&self, id: &PeripheralId, ticket: Ticket);
}

/// Type alias for a shareable transport.
pub type TransportHandle = Arc<dyn Transport>;

/// Sending half used by transports to report events.
#[derive(Debug, Clone)]
pub struct TransportSink {
   tx: mpsc::Sender<TransportEvent>,
}

impl TransportSink {
   pub async fn send(&self, event: TransportEvent) {
      if let Err(e) = self.tx.send(event).await {
         warn!("Session gone, dropping transport event: {:?}", e.0);
      }
   }
}

/// Receiving half consumed by the session actor.
#[derive(Debug)]
pub struct TransportEvents {
   rx: mpsc::Receiver<TransportEvent>,
}

impl TransportEvents {
   pub async fn recv(&mut self) -> Option<TransportEvent> {
      self.rx.recv().await
   }
}

/// Creates the event channel connecting a transport to a session.
pub fn channel() -> (TransportSink, TransportEvents) {
   let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
   (TransportSink { tx }, TransportEvents { rx })
}
