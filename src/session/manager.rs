//! Session manager: the facade callers talk to and the actor behind it.
//!
//! All caller commands, transport events and poller ticks are handled on a
//! single actor task, so the session state and the device registry are only
//! ever mutated from one place.

use std::time::Duration;

use log::{debug, info, warn};
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   time,
};

use crate::{
   bluetooth::transport::{
      AdapterState, CharacteristicInfo, OutboundMessage, Payload, PeripheralId, ServiceId, Ticket,
      TransportEvent, TransportEvents, TransportHandle,
   },
   config::SessionConfig,
   error::{SessionError, TransportError},
   event::{EventSender, SessionEvent},
   session::{
      registry::{ConnectionStatus, DeviceRegistry, PeripheralRecord, RssiSample},
      rssi::{PollerTick, RssiPoller, TickOutcome},
      state::{Session, SessionState},
   },
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 256;

/// How long shutdown waits for the transport to confirm a disconnect
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   StartScan(Reply<()>),
   StopScan(Reply<()>),
   Connect(PeripheralId, Reply<()>),
   Disconnect(Reply<()>),
   Send(Payload, Reply<Ticket>),
   Subscribe(EventSender),
   GetDevices(oneshot::Sender<Vec<PeripheralRecord>>),
   GetState(oneshot::Sender<SessionState>),
   /// Tears the link down and stops the actor.
   Shutdown(oneshot::Sender<()>),
}

// === Facade ===

/// Handle to a running session.
///
/// Commands return as soon as the actor has accepted or rejected them;
/// completion is reported through subscribed listeners. This type is cheaply
/// cloneable.
#[derive(Debug, Clone)]
pub struct SessionManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl SessionManager {
   /// Spawns the session actor on the current tokio runtime.
   pub fn spawn(
      config: SessionConfig,
      transport: TransportHandle,
      transport_events: TransportEvents,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (tick_tx, tick_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = ManagerActor {
         core: SessionCore::new(config, transport, tick_tx),
         command_rx,
         transport_rx: transport_events,
         tick_rx,
      };
      tokio::spawn(actor.run());
      Self { inbox: command_tx }
   }

   async fn request<T>(
      &self,
      command: impl FnOnce(Reply<T>) -> ManagerCommand,
   ) -> Result<T, SessionError> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(command(tx))
         .await
         .map_err(|_| SessionError::ManagerShutdown)?;
      rx.await.map_err(|_| SessionError::ManagerShutdown)?
   }

   pub async fn start_scan(&self) -> Result<(), SessionError> {
      self.request(ManagerCommand::StartScan).await
   }

   pub async fn stop_scan(&self) -> Result<(), SessionError> {
      self.request(ManagerCommand::StopScan).await
   }

   /// Starts connecting to a previously discovered peripheral.
   pub async fn connect(&self, id: PeripheralId) -> Result<(), SessionError> {
      self
         .request(|reply| ManagerCommand::Connect(id, reply))
         .await
   }

   pub async fn disconnect(&self) -> Result<(), SessionError> {
      self.request(ManagerCommand::Disconnect).await
   }

   /// Queues an acknowledged write to the session's writable characteristic.
   ///
   /// The returned ticket identifies the matching `SendCompleted` event.
   pub async fn send(&self, bytes: &[u8]) -> Result<Ticket, SessionError> {
      let payload = Payload::from_slice(bytes);
      self
         .request(|reply| ManagerCommand::Send(payload, reply))
         .await
   }

   pub async fn send_text(&self, text: &str) -> Result<Ticket, SessionError> {
      self.send(text.as_bytes()).await
   }

   pub async fn subscribe(&self, listener: EventSender) -> Result<(), SessionError> {
      self
         .inbox
         .send(ManagerCommand::Subscribe(listener))
         .await
         .map_err(|_| SessionError::ManagerShutdown)
   }

   /// Subscribes an unbounded channel and returns its receiving end.
   pub async fn subscribe_channel(
      &self,
   ) -> Result<mpsc::UnboundedReceiver<SessionEvent>, SessionError> {
      let (tx, rx) = mpsc::unbounded_channel();
      self.subscribe(std::sync::Arc::new(tx)).await?;
      Ok(rx)
   }

   pub async fn devices(&self) -> Vec<PeripheralRecord> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetDevices(tx))
         .await
         .is_err()
      {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }

   pub async fn state(&self) -> Result<SessionState, SessionError> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::GetState(tx))
         .await
         .map_err(|_| SessionError::ManagerShutdown)?;
      rx.await.map_err(|_| SessionError::ManagerShutdown)
   }

   /// Disconnects the peripheral, stops scanning and ends the actor. Returns
   /// once the transport confirmed the disconnect or a short grace period
   /// ran out.
   pub async fn shutdown(&self) -> Result<(), SessionError> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Shutdown(tx))
         .await
         .map_err(|_| SessionError::ManagerShutdown)?;
      rx.await.map_err(|_| SessionError::ManagerShutdown)
   }
}

// === Manager Actor ===

struct ManagerActor {
   core: SessionCore,
   command_rx: mpsc::Receiver<ManagerCommand>,
   transport_rx: TransportEvents,
   tick_rx: mpsc::Receiver<PollerTick>,
}

impl ManagerActor {
   async fn run(mut self) {
      info!("Session manager starting up");

      let mut requested = None;
      loop {
         select! {
             cmd = self.command_rx.recv() => {
                 match cmd {
                     Some(ManagerCommand::Shutdown(reply)) => {
                         requested = Some(reply);
                         break;
                     }
                     Some(cmd) => self.core.handle_command(cmd),
                     None => break,
                 }
             }
             Some(event) = self.transport_rx.recv() => {
                 self.core.handle_transport_event(event);
             }
             Some(tick) = self.tick_rx.recv() => {
                 self.core.handle_tick(tick);
             }
         }
      }

      info!("Session manager shutting down");
      self.finish().await;
      if let Some(reply) = requested {
         let _ = reply.send(());
      }
   }

   /// Releases the session, giving the transport a moment to drop the link.
   async fn finish(&mut self) {
      let Some((id, attempt)) = self.core.shutdown() else {
         return;
      };
      let transport_rx = &mut self.transport_rx;
      let confirmed = async {
         while let Some(event) = transport_rx.recv().await {
            let (TransportEvent::Disconnected {
               id: gone,
               attempt: tag,
               ..
            }
            | TransportEvent::ConnectFailed {
               id: gone,
               attempt: tag,
               ..
            }) = &event
            else {
               continue;
            };
            if *gone == id && *tag == attempt {
               return;
            }
         }
      };
      if time::timeout(SHUTDOWN_GRACE, confirmed).await.is_err() {
         warn!("Timed out waiting for {id} to disconnect");
      }
   }
}

// === Session Core ===

/// State owned by the actor. Every method runs on the actor task.
struct SessionCore {
   config: SessionConfig,
   transport: TransportHandle,
   listeners: Vec<EventSender>,
   registry: DeviceRegistry,
   session: Session,
   poller: RssiPoller,
   tick_tx: mpsc::Sender<PollerTick>,
   next_ticket: u64,
}

impl SessionCore {
   fn new(
      config: SessionConfig,
      transport: TransportHandle,
      tick_tx: mpsc::Sender<PollerTick>,
   ) -> Self {
      Self {
         poller: RssiPoller::new(config.rssi_poll_interval),
         config,
         transport,
         listeners: Vec::new(),
         registry: DeviceRegistry::new(),
         session: Session::default(),
         tick_tx,
         next_ticket: 0,
      }
   }

   fn emit(&self, event: SessionEvent) {
      for listener in &self.listeners {
         listener.emit(&event);
      }
   }

   fn set_state(&mut self, new: SessionState) {
      if let Some(old) = self.session.transition(new) {
         info!("Session state: {old} -> {new}");
         self.emit(SessionEvent::StateChanged { old, new });
      }
   }

   fn ticket(&mut self) -> Ticket {
      self.next_ticket += 1;
      Ticket(self.next_ticket)
   }

   fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::StartScan(reply) => {
            let _ = reply.send(self.start_scan());
         },
         ManagerCommand::StopScan(reply) => {
            let _ = reply.send(self.stop_scan());
         },
         ManagerCommand::Connect(id, reply) => {
            let _ = reply.send(self.connect(id));
         },
         ManagerCommand::Disconnect(reply) => {
            let _ = reply.send(self.disconnect());
         },
         ManagerCommand::Send(payload, reply) => {
            let _ = reply.send(self.send(&payload));
         },
         ManagerCommand::Subscribe(listener) => {
            self.listeners.push(listener);
         },
         ManagerCommand::GetDevices(reply) => {
            let _ = reply.send(self.registry.list());
         },
         ManagerCommand::GetState(reply) => {
            let _ = reply.send(self.session.state);
         },
         // Intercepted by the actor loop
         ManagerCommand::Shutdown(reply) => {
            let _ = reply.send(());
         },
      }
   }

   // --- Caller commands ---

   fn start_scan(&mut self) -> Result<(), SessionError> {
      if !self.session.scan_active {
         info!("Scanning for peripherals");
         self.transport.scan();
         self.session.scan_active = true;
      }
      if self.session.state == SessionState::Idle {
         self.set_state(SessionState::Scanning);
      }
      Ok(())
   }

   fn stop_scan(&mut self) -> Result<(), SessionError> {
      self.halt_scan();
      if self.session.state == SessionState::Scanning {
         self.set_state(SessionState::Idle);
      }
      Ok(())
   }

   fn halt_scan(&mut self) {
      if self.session.scan_active {
         info!("Stopping scan");
         self.transport.stop_scan();
         self.session.scan_active = false;
      }
   }

   fn connect(&mut self, id: PeripheralId) -> Result<(), SessionError> {
      if !self.registry.contains(&id) {
         return Err(SessionError::UnknownDevice(id));
      }
      if !self.session.state.can_connect() {
         return Err(SessionError::Busy);
      }

      let attempt = self.ticket();
      info!("Connecting to {id} (attempt {attempt})");
      self.transport.connect(&id, attempt);
      self.session.peripheral = Some(id);
      self.session.attempt = Some(attempt);
      self.set_state(SessionState::Connecting);
      Ok(())
   }

   fn disconnect(&mut self) -> Result<(), SessionError> {
      // Link resources go in this step, whatever the state
      self.teardown_link();

      match self.session.state {
         SessionState::Connecting | SessionState::Connected => {
            if let (Some(id), Some(attempt)) =
               (self.session.peripheral.clone(), self.session.attempt)
            {
               info!("Disconnecting from {id}");
               self.transport.disconnect(&id, attempt);
            }
            self.set_state(SessionState::Disconnecting);
         },
         state => debug!("Disconnect requested while {state}"),
      }
      Ok(())
   }

   fn send(&mut self, payload: &[u8]) -> Result<Ticket, SessionError> {
      if self.session.state != SessionState::Connected {
         return Err(SessionError::NotConnected);
      }
      let Some(id) = self.session.peripheral.clone() else {
         return Err(SessionError::NotConnected);
      };
      let Some(characteristic) = self.session.writable else {
         return Err(SessionError::NoWritableCharacteristic);
      };
      if payload.is_empty() {
         return Err(SessionError::EmptyPayload);
      }

      let ticket = self.ticket();
      debug!("→ {id} [{characteristic}] {ticket}: {}", hex::encode(payload));
      self.session.pending_writes.insert(ticket);
      self
         .transport
         .write(&id, characteristic, OutboundMessage::acknowledged(payload), ticket);
      Ok(ticket)
   }

   /// Stops the poller and fails every outstanding write.
   fn teardown_link(&mut self) {
      self.poller.stop();
      for ticket in self.session.clear_link() {
         self.emit(SessionEvent::SendCompleted {
            ticket,
            result: Err(SessionError::ConnectionLost),
         });
      }
   }

   // --- Transport events ---

   fn handle_transport_event(&mut self, event: TransportEvent) {
      match event {
         TransportEvent::AdapterStateChanged(state) => self.handle_adapter_state(state),
         TransportEvent::Discovered { id, name, rssi } => {
            self.handle_discovered(id, name, rssi);
         },
         TransportEvent::ScanFailed(error) => self.handle_scan_failed(error),
         TransportEvent::Connected { id, attempt } => self.handle_connected(id, attempt),
         TransportEvent::ConnectFailed { id, attempt, error } => {
            self.handle_connect_failed(id, attempt, error);
         },
         TransportEvent::Disconnected { id, attempt, error } => {
            self.handle_disconnected(id, attempt, error);
         },
         TransportEvent::ServicesDiscovered { id, result } => {
            self.handle_services_discovered(id, result);
         },
         TransportEvent::CharacteristicsDiscovered {
            id,
            service,
            result,
         } => self.handle_characteristics_discovered(id, service, result),
         TransportEvent::WriteCompleted { id, ticket, result } => {
            self.handle_write_completed(id, ticket, result);
         },
         TransportEvent::RssiRead { id, ticket, result } => {
            self.handle_rssi_read(id, ticket, result);
         },
      }
   }

   fn handle_adapter_state(&mut self, state: AdapterState) {
      info!("Adapter state: {state}");
      self.emit(SessionEvent::AdapterStateChanged(state));

      match state {
         AdapterState::PoweredOn => {
            if self.config.scan_on_power_on && self.session.state == SessionState::Idle {
               let _ = self.start_scan();
            }
         },
         AdapterState::Unknown => {},
         _ => {
            // Radio gone: nothing is scanning and no link survives
            self.session.scan_active = false;
            if let Some(id) = self.session.peripheral.clone() {
               self.link_lost(&id, Some(TransportError::new(format!("adapter {state}"))));
            } else if self.session.state == SessionState::Scanning {
               self.set_state(SessionState::Idle);
            }
         },
      }
   }

   fn handle_discovered(
      &mut self,
      id: PeripheralId,
      name: Option<SmolStr>,
      rssi: Option<i16>,
   ) {
      let record = PeripheralRecord::discovered(id, name);
      if self.registry.upsert(record.clone()) {
         info!(
            "Discovered {} ({}), advertised RSSI {rssi:?}",
            record.id,
            record.display_name()
         );
         self.emit(SessionEvent::DeviceDiscovered(record));
      }
   }

   fn handle_scan_failed(&mut self, error: TransportError) {
      warn!("Scan failed: {error}");
      self.session.scan_active = false;
      self.emit(SessionEvent::ErrorReported(SessionError::ScanFailed(error)));
      if self.session.state == SessionState::Scanning {
         self.set_state(SessionState::Idle);
      }
   }

   fn handle_connected(&mut self, id: PeripheralId, attempt: Ticket) {
      if self.session.state != SessionState::Connecting || !self.session.is_attempt(&id, attempt) {
         debug!(
            "Discarding stale connection {attempt} to {id} while {}",
            self.session.state
         );
         // A link to the session's own peripheral is owned by its pending
         // disconnect or by the newer attempt
         if !self.session.is_current(&id) {
            self.transport.disconnect(&id, attempt);
         }
         return;
      }

      self.registry.mark_connected(&id);
      self.set_state(SessionState::Connected);
      self.poller.start(self.tick_tx.clone());

      if self.config.stop_scan_on_connect {
         self.halt_scan();
      }
      self.transport.discover_services(&id);
   }

   fn handle_connect_failed(&mut self, id: PeripheralId, attempt: Ticket, error: TransportError) {
      if !self.session.is_attempt(&id, attempt) {
         debug!("Ignoring connect failure for stale attempt {attempt} to {id}: {error}");
         return;
      }

      match self.session.state {
         SessionState::Connecting => {
            warn!("Failed to connect to {id}: {error}");
            self.teardown_link();
            self.session.release();
            self.set_state(SessionState::Error);
            self.emit(SessionEvent::ErrorReported(SessionError::ConnectionFailed(
               error,
            )));
            self.set_state(SessionState::Idle);
         },
         SessionState::Disconnecting => {
            debug!("Cancelled connection to {id} resolved: {error}");
            self.session.release();
            self.set_state(SessionState::Idle);
         },
         state => debug!("Ignoring connect failure for {id} while {state}"),
      }
   }

   fn handle_disconnected(
      &mut self,
      id: PeripheralId,
      attempt: Ticket,
      error: Option<TransportError>,
   ) {
      if !self.session.is_attempt(&id, attempt) {
         debug!("Ignoring disconnect of {id} for stale attempt {attempt}");
         return;
      }
      self.link_lost(&id, error);
   }

   /// Common cleanup for requested and unexpected disconnects.
   fn link_lost(&mut self, id: &PeripheralId, error: Option<TransportError>) {
      let was = self.session.state;
      self.teardown_link();

      if self
         .registry
         .get(id)
         .is_some_and(|r| r.status == ConnectionStatus::Connected)
      {
         self.registry.mark_disconnected(id);
      }

      if was == SessionState::Disconnecting {
         info!("Disconnected from {id}");
      } else {
         match &error {
            Some(error) => warn!("Lost connection to {id}: {error}"),
            None => warn!("Lost connection to {id}"),
         }
         self.emit(SessionEvent::ErrorReported(SessionError::ConnectionLost));
      }

      self.session.release();
      self.set_state(SessionState::Idle);
   }

   fn handle_services_discovered(
      &mut self,
      id: PeripheralId,
      result: Result<Vec<ServiceId>, TransportError>,
   ) {
      if self.session.state != SessionState::Connected || !self.session.is_current(&id) {
         debug!("Discarding stale service discovery for {id}");
         return;
      }

      match result {
         Ok(services) if services.is_empty() => {
            info!("{id} exposes no services");
            self.finish_discovery(&id);
         },
         Ok(services) => {
            debug!("{id} exposes {} services", services.len());
            self.session.pending_services = services.len();
            for service in services {
               self.transport.discover_characteristics(&id, service);
            }
         },
         Err(error) => {
            warn!("Service discovery on {id} failed: {error}");
            self.emit(SessionEvent::ErrorReported(SessionError::DiscoveryFailed(
               error,
            )));
            self.finish_discovery(&id);
         },
      }
   }

   fn handle_characteristics_discovered(
      &mut self,
      id: PeripheralId,
      service: ServiceId,
      result: Result<Vec<CharacteristicInfo>, TransportError>,
   ) {
      if self.session.state != SessionState::Connected
         || !self.session.is_current(&id)
         || self.session.pending_services == 0
      {
         debug!("Discarding stale characteristic discovery for {id}");
         return;
      }

      match result {
         Ok(characteristics) => {
            if self.session.writable.is_none()
               && let Some(c) = characteristics.iter().find(|c| c.props.is_writable())
            {
               info!("Writable characteristic {} ({}) on {id}", c.id, c.uuid);
               self.session.writable = Some(c.id);
            }
         },
         Err(error) => {
            warn!(
               "Characteristic discovery for service {:#06x} on {id} failed: {error}",
               service.0
            );
            self.emit(SessionEvent::ErrorReported(SessionError::DiscoveryFailed(
               error,
            )));
         },
      }

      self.session.pending_services -= 1;
      if self.session.pending_services == 0 {
         self.finish_discovery(&id);
      }
   }

   fn finish_discovery(&mut self, id: &PeripheralId) {
      self.session.discovery_complete = true;
      if self.session.writable.is_none() {
         warn!("No writable characteristic found on {id}");
      }
      self.emit(SessionEvent::DiscoveryCompleted {
         id: id.clone(),
         writable: self.session.writable,
      });
   }

   fn handle_write_completed(
      &mut self,
      id: PeripheralId,
      ticket: Ticket,
      result: Result<(), TransportError>,
   ) {
      if !self.session.pending_writes.remove(&ticket) {
         debug!("Discarding completion of write {ticket} to {id}");
         return;
      }
      let result = result.map_err(|error| {
         warn!("Write {ticket} to {id} failed: {error}");
         SessionError::WriteFailed(error)
      });
      if result.is_ok() {
         debug!("Write {ticket} to {id} acknowledged");
      }
      self.emit(SessionEvent::SendCompleted { ticket, result });
   }

   // --- RSSI ---

   fn handle_tick(&mut self, tick: PollerTick) {
      if self.session.state != SessionState::Connected {
         return;
      }
      let Some(id) = self.session.peripheral.clone() else {
         return;
      };
      let ticket = self.ticket();
      match self.poller.on_tick(tick, ticket) {
         TickOutcome::Read(ticket) => self.transport.read_rssi(&id, ticket),
         TickOutcome::Coalesced => debug!("RSSI read for {id} still in flight, skipping tick"),
         TickOutcome::Stale => debug!("Dropping stale RSSI tick"),
      }
   }

   fn handle_rssi_read(
      &mut self,
      id: PeripheralId,
      ticket: Ticket,
      result: Result<i16, TransportError>,
   ) {
      if !self.session.is_current(&id) || !self.poller.complete(ticket) {
         debug!("Discarding late RSSI result {ticket} for {id}");
         return;
      }

      match result {
         Ok(dbm) => {
            let sample = RssiSample::now(dbm);
            self.registry.update_rssi(&id, sample);
            self.emit(SessionEvent::RssiUpdated { id, sample });
         },
         Err(error) => {
            debug!("RSSI read for {id} failed: {error}");
            self.emit(SessionEvent::ErrorReported(SessionError::RssiRead(error)));
         },
      }
   }

   /// Final cleanup. Returns the link whose disconnect was requested.
   fn shutdown(&mut self) -> Option<(PeripheralId, Ticket)> {
      info!("Cleaning up session");
      self.teardown_link();
      self.halt_scan();
      let connected = self.session.state.has_peripheral();
      let link = self.session.release()?;
      if !connected {
         return None;
      }
      self.transport.disconnect(&link.0, link.1);
      Some(link)
   }
}
