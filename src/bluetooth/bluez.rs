//! BlueZ transport built on `bluer`.
//!
//! Each [`Transport`] call spawns a short task that talks to `bluetoothd`
//! over D-Bus and reports the outcome through the [`TransportSink`]. Long
//! lived tasks (scan, power monitor, link monitors) are tracked so they can
//! be aborted.

use std::{collections::HashMap, pin::pin, str::FromStr, sync::Arc, time::Duration};

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty, Session,
   gatt::{
      WriteOp,
      remote::{Characteristic, CharacteristicWriteRequest},
   },
};
use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{task::JoinHandle, time};

use crate::{
   bluetooth::transport::{
      AdapterState, CharacteristicId, CharacteristicInfo, CharacteristicProps, OutboundMessage,
      PeripheralId, ServiceId, Ticket, Transport, TransportEvent, TransportSink, WriteMode,
   },
   config::Config,
   error::{Result, TransportError},
};

/// A task tied to one connection attempt.
type AttemptTask = (Ticket, JoinHandle<()>);

/// Background tasks. Each attempt lives in `connects` until its link is up,
/// then in `links`; whoever removes the entry reports the attempt's end, so
/// every attempt ends with exactly one `ConnectFailed` or `Disconnected`.
#[derive(Default)]
struct Tasks {
   scan: Option<JoinHandle<()>>,
   power: Option<JoinHandle<()>>,
   connects: HashMap<PeripheralId, AttemptTask>,
   links: HashMap<PeripheralId, AttemptTask>,
}

impl Tasks {
   /// Removes the entry for `id` if it belongs to `attempt`.
   fn claim(
      map: &mut HashMap<PeripheralId, AttemptTask>,
      id: &PeripheralId,
      attempt: Ticket,
   ) -> Option<JoinHandle<()>> {
      if map.get(id).is_some_and(|(tag, _)| *tag == attempt) {
         map.remove(id).map(|(_, handle)| handle)
      } else {
         None
      }
   }

   fn abort_all(&mut self) {
      let handles = self
         .scan
         .take()
         .into_iter()
         .chain(self.power.take())
         .chain(self.connects.drain().map(|(_, (_, h))| h))
         .chain(self.links.drain().map(|(_, (_, h))| h));
      for handle in handles {
         handle.abort();
      }
   }
}

struct BluezInner {
   _session: Session,
   adapter: Adapter,
   events: TransportSink,
   connect_timeout: Duration,
   tasks: Arc<Mutex<Tasks>>,
}

impl Drop for BluezInner {
   fn drop(&mut self) {
      self.tasks.lock().abort_all();
   }
}

/// Transport over the system's BlueZ daemon. Cheaply cloneable.
///
/// RSSI reads return the value BlueZ last took from an advertising report.
/// On a connected LE link that value is usually frozen or absent, so polled
/// samples may repeat or fail with "RSSI unavailable".
#[derive(Clone)]
pub struct BluezTransport(Arc<BluezInner>);

impl BluezTransport {
   /// Opens the configured adapter (or the default one) and starts reporting
   /// its power state.
   pub async fn new(config: &Config, events: TransportSink) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match &config.adapter {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };
      info!("Using Bluetooth adapter {}", adapter.name());

      let transport = Self(Arc::new(BluezInner {
         _session: session,
         adapter,
         events,
         connect_timeout: config.connect_timeout(),
         tasks: Arc::new(Mutex::new(Tasks::default())),
      }));
      let monitor = transport.spawn_power_monitor();
      transport.0.tasks.lock().power = Some(monitor);
      Ok(transport)
   }

   fn device(&self, id: &PeripheralId) -> std::result::Result<Device, TransportError> {
      let address = Address::from_str(id.as_str())
         .map_err(|e| TransportError::new(format!("invalid address {id}: {e}")))?;
      Ok(self.0.adapter.device(address)?)
   }

   fn spawn_power_monitor(&self) -> JoinHandle<()> {
      let adapter = self.0.adapter.clone();
      let sink = self.0.events.clone();
      tokio::spawn(async move {
         let initial = match adapter.is_powered().await {
            Ok(true) => AdapterState::PoweredOn,
            Ok(false) => AdapterState::PoweredOff,
            Err(e) => {
               warn!("Failed to query adapter power: {e}");
               AdapterState::Unknown
            },
         };
         sink.send(TransportEvent::AdapterStateChanged(initial)).await;

         let events = match adapter.events().await {
            Ok(events) => events,
            Err(e) => {
               warn!("Failed to monitor adapter {}: {e}", adapter.name());
               return;
            },
         };
         let mut events = pin!(events);
         while let Some(event) = events.next().await {
            if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
               let state = if powered {
                  AdapterState::PoweredOn
               } else {
                  AdapterState::PoweredOff
               };
               sink.send(TransportEvent::AdapterStateChanged(state)).await;
            }
         }

         // Event stream ended, the adapter went away
         sink
            .send(TransportEvent::AdapterStateChanged(AdapterState::Unsupported))
            .await;
      })
   }

   async fn scan_task(self) {
      let adapter = &self.0.adapter;
      let discovery = match adapter.discover_devices().await {
         Ok(discovery) => discovery,
         Err(e) => {
            warn!("Failed to start discovery: {e}");
            self.0.events.send(TransportEvent::ScanFailed(e.into())).await;
            return;
         },
      };
      let mut discovery = pin!(discovery);

      while let Some(event) = discovery.next().await {
         let AdapterEvent::DeviceAdded(address) = event else {
            continue;
         };
         let Ok(device) = adapter.device(address) else {
            continue;
         };
         let name = device.name().await.ok().flatten().map(SmolStr::from);
         let rssi = device.rssi().await.ok().flatten();
         debug!("Device added: {address} {name:?} RSSI {rssi:?}");
         self
            .0
            .events
            .send(TransportEvent::Discovered {
               id: address.into(),
               name,
               rssi,
            })
            .await;
      }

      warn!("Discovery stream on {} ended", adapter.name());
      self
         .0
         .events
         .send(TransportEvent::ScanFailed(TransportError::new(
            "discovery stream ended",
         )))
         .await;
   }

   async fn connect_task(self, id: PeripheralId, attempt: Ticket) {
      let result = match self.device(&id) {
         Ok(device) => match time::timeout(self.0.connect_timeout, device.connect()).await {
            Ok(Ok(())) => Ok(device),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TransportError::new("connection timed out")),
         },
         Err(e) => Err(e),
      };

      let event = {
         let mut tasks = self.0.tasks.lock();
         if Tasks::claim(&mut tasks.connects, &id, attempt).is_none() {
            // Cancelled; the disconnect reports the end of this attempt
            return;
         }
         match result {
            Ok(device) => {
               info!("Connected to {id}");
               let monitor = self.spawn_link_monitor(id.clone(), attempt, device);
               if let Some((_, old)) = tasks.links.insert(id.clone(), (attempt, monitor)) {
                  old.abort();
               }
               TransportEvent::Connected { id, attempt }
            },
            Err(error) => {
               warn!("Failed to connect to {id}: {error}");
               TransportEvent::ConnectFailed { id, attempt, error }
            },
         }
      };
      self.0.events.send(event).await;
   }

   /// Reports the link dropping without a local request.
   fn spawn_link_monitor(
      &self,
      id: PeripheralId,
      attempt: Ticket,
      device: Device,
   ) -> JoinHandle<()> {
      let sink = self.0.events.clone();
      let tasks = self.0.tasks.clone();
      tokio::spawn(async move {
         let events = match device.events().await {
            Ok(events) => events,
            Err(e) => {
               warn!("Failed to monitor link to {id}: {e}");
               return;
            },
         };
         let mut events = pin!(events);
         while let Some(event) = events.next().await {
            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
               // Dropping our own handle does not abort the task
               if Tasks::claim(&mut tasks.lock().links, &id, attempt).is_none() {
                  return;
               }
               sink
                  .send(TransportEvent::Disconnected {
                     id,
                     attempt,
                     error: Some(TransportError::new("link lost")),
                  })
                  .await;
               return;
            }
         }
      })
   }

   async fn disconnect_task(self, id: PeripheralId, attempt: Ticket) {
      match self.device(&id) {
         Ok(device) => {
            if let Err(e) = device.disconnect().await {
               warn!("Disconnect from {id} reported: {e}");
            }
         },
         Err(e) => warn!("Cannot disconnect {id}: {e}"),
      }
      self
         .0
         .events
         .send(TransportEvent::Disconnected {
            id,
            attempt,
            error: None,
         })
         .await;
   }

   async fn services(
      &self,
      id: &PeripheralId,
   ) -> std::result::Result<Vec<ServiceId>, TransportError> {
      let device = self.device(id)?;
      let services = device.services().await?;
      Ok(services.iter().map(|s| ServiceId(s.id())).collect())
   }

   async fn characteristics(
      &self,
      id: &PeripheralId,
      service: ServiceId,
   ) -> std::result::Result<Vec<CharacteristicInfo>, TransportError> {
      let device = self.device(id)?;
      let remote = device.service(service.0).await?;
      let mut out = Vec::new();
      for characteristic in remote.characteristics().await? {
         let flags = characteristic.flags().await?;
         out.push(CharacteristicInfo {
            id: CharacteristicId {
               service,
               handle: characteristic.id(),
            },
            uuid: characteristic.uuid().await?,
            props: CharacteristicProps {
               read: flags.read,
               write: flags.write,
               write_without_response: flags.write_without_response,
               notify: flags.notify,
            },
         });
      }
      Ok(out)
   }

   async fn characteristic(
      &self,
      id: &PeripheralId,
      characteristic: CharacteristicId,
   ) -> std::result::Result<Characteristic, TransportError> {
      let device = self.device(id)?;
      let service = device.service(characteristic.service.0).await?;
      Ok(service.characteristic(characteristic.handle).await?)
   }

   async fn write_value(
      &self,
      id: &PeripheralId,
      characteristic: CharacteristicId,
      message: &OutboundMessage,
   ) -> std::result::Result<(), TransportError> {
      let remote = self.characteristic(id, characteristic).await?;
      let mut request = CharacteristicWriteRequest::default();
      request.op_type = match message.mode {
         WriteMode::WithResponse => WriteOp::Request,
         WriteMode::WithoutResponse => WriteOp::Command,
      };
      remote.write_ext(&message.payload, &request).await?;
      Ok(())
   }

   /// BlueZ only refreshes a device's RSSI from advertising reports. Once an
   /// LE link is up most peripherals stop advertising, so the value read here
   /// may stay frozen at its last advertised level or be missing, which is
   /// reported as an error.
   async fn rssi(&self, id: &PeripheralId) -> std::result::Result<i16, TransportError> {
      self
         .device(id)?
         .rssi()
         .await?
         .ok_or_else(|| TransportError::new("RSSI unavailable"))
   }
}

impl Transport for BluezTransport {
   fn scan(&self) {
      let mut tasks = self.0.tasks.lock();
      if tasks.scan.as_ref().is_some_and(|h| !h.is_finished()) {
         return;
      }
      info!("Starting discovery on {}", self.0.adapter.name());
      tasks.scan = Some(tokio::spawn(self.clone().scan_task()));
   }

   fn stop_scan(&self) {
      // Dropping the discovery stream ends discovery
      if let Some(handle) = self.0.tasks.lock().scan.take() {
         handle.abort();
         info!("Stopped discovery on {}", self.0.adapter.name());
      }
   }

   fn connect(&self, id: &PeripheralId, attempt: Ticket) {
      // Registered before the task can look for its own entry
      let mut tasks = self.0.tasks.lock();
      let handle = tokio::spawn(self.clone().connect_task(id.clone(), attempt));
      if let Some((_, old)) = tasks.connects.insert(id.clone(), (attempt, handle)) {
         old.abort();
      }
   }

   fn disconnect(&self, id: &PeripheralId, attempt: Ticket) {
      let claimed = {
         let mut tasks = self.0.tasks.lock();
         let pending = Tasks::claim(&mut tasks.connects, id, attempt);
         let link = Tasks::claim(&mut tasks.links, id, attempt);
         let claimed = pending.is_some() || link.is_some();
         for handle in pending.into_iter().chain(link) {
            handle.abort();
         }
         claimed
      };
      if !claimed {
         debug!("Attempt {attempt} to {id} already ended");
         return;
      }
      tokio::spawn(self.clone().disconnect_task(id.clone(), attempt));
   }

   fn discover_services(&self, id: &PeripheralId) {
      let this = self.clone();
      let id = id.clone();
      tokio::spawn(async move {
         let result = this.services(&id).await;
         this
            .0
            .events
            .send(TransportEvent::ServicesDiscovered { id, result })
            .await;
      });
   }

   fn discover_characteristics(&self, id: &PeripheralId, service: ServiceId) {
      let this = self.clone();
      let id = id.clone();
      tokio::spawn(async move {
         let result = this.characteristics(&id, service).await;
         this
            .0
            .events
            .send(TransportEvent::CharacteristicsDiscovered {
               id,
               service,
               result,
            })
            .await;
      });
   }

   fn write(
      &self,
      id: &PeripheralId,
      characteristic: CharacteristicId,
      message: OutboundMessage,
      ticket: Ticket,
   ) {
      let this = self.clone();
      let id = id.clone();
      tokio::spawn(async move {
         debug!(
            "→ {id} [{characteristic}] ({}): {}",
            message.mode,
            hex::encode(&message.payload)
         );
         let result = this.write_value(&id, characteristic, &message).await;
         this
            .0
            .events
            .send(TransportEvent::WriteCompleted { id, ticket, result })
            .await;
      });
   }

   fn read_rssi(&self, id: &PeripheralId, ticket: Ticket) {
      let this = self.clone();
      let id = id.clone();
      tokio::spawn(async move {
         let result = this.rssi(&id).await;
         this
            .0
            .events
            .send(TransportEvent::RssiRead { id, ticket, result })
            .await;
      });
   }
}
