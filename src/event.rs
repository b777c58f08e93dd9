//! Event handling for session status updates.
//!
//! The session actor republishes transport activity as normalized
//! [`SessionEvent`]s to every subscribed [`EventBus`].

use std::{fmt, sync::Arc};

use serde_json::json;
use tokio::sync::mpsc;

use crate::{
   bluetooth::transport::{AdapterState, CharacteristicId, PeripheralId, Ticket},
   error::SessionError,
   session::{
      registry::{PeripheralRecord, RssiSample},
      state::SessionState,
   },
};

/// Events that can be emitted by the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
   AdapterStateChanged(AdapterState),
   DeviceDiscovered(PeripheralRecord),
   StateChanged {
      old: SessionState,
      new: SessionState,
   },
   /// Characteristic discovery finished for every service of `id`.
   DiscoveryCompleted {
      id: PeripheralId,
      writable: Option<CharacteristicId>,
   },
   RssiUpdated {
      id: PeripheralId,
      sample: RssiSample,
   },
   SendCompleted {
      ticket: Ticket,
      result: Result<(), SessionError>,
   },
   /// A failure that is not tied to a caller's request.
   ErrorReported(SessionError),
}

impl SessionEvent {
   /// Converts the event to a JSON representation.
   pub fn to_json(&self) -> serde_json::Value {
      match self {
         Self::AdapterStateChanged(state) => json!({
             "event": "adapter_state_changed",
             "state": state,
         }),
         Self::DeviceDiscovered(record) => json!({
             "event": "device_discovered",
             "device": record,
         }),
         Self::StateChanged { old, new } => json!({
             "event": "state_changed",
             "old": old,
             "new": new,
         }),
         Self::DiscoveryCompleted { id, writable } => json!({
             "event": "discovery_completed",
             "id": id,
             "writable": writable.map(|c| c.to_string()),
         }),
         Self::RssiUpdated { id, sample } => json!({
             "event": "rssi_updated",
             "id": id,
             "rssi": sample.dbm,
         }),
         Self::SendCompleted { ticket, result } => json!({
             "event": "send_completed",
             "ticket": ticket,
             "ok": result.is_ok(),
             "error": result.as_ref().err().map(ToString::to_string),
         }),
         Self::ErrorReported(error) => json!({
             "event": "error",
             "error": error.to_string(),
         }),
      }
   }
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Delivers an event to this listener.
   fn emit(&self, event: &SessionEvent);
}

impl fmt::Debug for dyn EventBus {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str("EventBus")
   }
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

impl EventBus for mpsc::UnboundedSender<SessionEvent> {
   fn emit(&self, event: &SessionEvent) {
      let _ = self.send(event.clone());
   }
}
