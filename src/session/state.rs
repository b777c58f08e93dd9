//! Session lifecycle states and the bookkeeping of the active connection.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::bluetooth::transport::{CharacteristicId, PeripheralId, Ticket};

/// Lifecycle state of the (single) session.
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
   #[default]
   Idle,
   Scanning,
   Connecting,
   Connected,
   Disconnecting,
   /// Transient: a failure is being reported before returning to `Idle`.
   Error,
}

impl SessionState {
   /// States from which a new connection attempt may start.
   pub const fn can_connect(self) -> bool {
      matches!(self, Self::Idle | Self::Scanning)
   }

   /// States that own a peripheral.
   pub const fn has_peripheral(self) -> bool {
      matches!(self, Self::Connecting | Self::Connected | Self::Disconnecting)
   }
}

/// The one active session.
#[derive(Debug, Default)]
pub struct Session {
   pub state: SessionState,
   /// Peripheral being connected, connected, or disconnected.
   pub peripheral: Option<PeripheralId>,
   /// Tag of the connection attempt to `peripheral`.
   pub attempt: Option<Ticket>,
   pub writable: Option<CharacteristicId>,
   /// Services still waiting for characteristic discovery.
   pub pending_services: usize,
   pub discovery_complete: bool,
   /// Writes issued and not yet acknowledged.
   pub pending_writes: BTreeSet<Ticket>,
   /// Whether the radio scan is running, independently of `state`.
   pub scan_active: bool,
}

impl Session {
   /// True if `id` is the peripheral of the current attempt.
   pub fn is_current(&self, id: &PeripheralId) -> bool {
      self.peripheral.as_ref() == Some(id)
   }

   /// True if a link event tagged `attempt` belongs to the current attempt.
   pub fn is_attempt(&self, id: &PeripheralId, attempt: Ticket) -> bool {
      self.is_current(id) && self.attempt == Some(attempt)
   }

   /// Moves to `new`, returning the previous state if it changed.
   pub fn transition(&mut self, new: SessionState) -> Option<SessionState> {
      let old = self.state;
      if old == new {
         return None;
      }
      self.state = new;
      Some(old)
   }

   /// Drops everything tied to the link. Returns the tickets of writes that
   /// will never be acknowledged.
   pub fn clear_link(&mut self) -> BTreeSet<Ticket> {
      self.writable = None;
      self.pending_services = 0;
      self.discovery_complete = false;
      std::mem::take(&mut self.pending_writes)
   }

   /// Releases the peripheral after the link is fully gone.
   pub fn release(&mut self) -> Option<(PeripheralId, Ticket)> {
      let attempt = self.attempt.take();
      self.peripheral.take().zip(attempt)
   }
}

#[cfg(test)]
mod tests {
   use std::str::FromStr;

   use super::*;

   #[test]
   fn test_transition_reports_previous_state() {
      let mut session = Session::default();
      assert_eq!(session.state, SessionState::Idle);
      assert_eq!(
         session.transition(SessionState::Scanning),
         Some(SessionState::Idle)
      );
      assert_eq!(session.transition(SessionState::Scanning), None);
   }

   #[test]
   fn test_clear_link_resets_characteristic_and_writes() {
      let mut session = Session {
         state: SessionState::Connected,
         peripheral: Some("1".into()),
         attempt: Some(Ticket(1)),
         writable: Some(CharacteristicId {
            service: crate::bluetooth::transport::ServiceId(1),
            handle: 2,
         }),
         pending_services: 3,
         discovery_complete: true,
         pending_writes: [Ticket(4), Ticket(5)].into(),
         scan_active: true,
      };

      let dropped = session.clear_link();
      assert_eq!(dropped.into_iter().collect::<Vec<_>>(), vec![Ticket(4), Ticket(5)]);
      assert!(session.writable.is_none());
      assert!(session.pending_writes.is_empty());
      assert!(!session.discovery_complete);
      assert!(session.is_current(&"1".into()));
      assert!(session.scan_active);
      assert!(session.is_attempt(&"1".into(), Ticket(1)));
   }

   #[test]
   fn test_release_forgets_attempt() {
      let mut session = Session {
         peripheral: Some("1".into()),
         attempt: Some(Ticket(3)),
         ..Session::default()
      };
      assert!(!session.is_attempt(&"1".into(), Ticket(2)));
      assert_eq!(session.release(), Some(("1".into(), Ticket(3))));
      assert!(!session.is_attempt(&"1".into(), Ticket(3)));
   }

   #[test]
   fn test_state_names() {
      assert_eq!(SessionState::Disconnecting.to_string(), "disconnecting");
      assert_eq!(
         SessionState::from_str("connected").unwrap(),
         SessionState::Connected
      );
      assert!(SessionState::Scanning.can_connect());
      assert!(!SessionState::Connected.can_connect());
   }
}
