//! Registry of peripherals seen during the current session.

use std::{collections::HashMap, time::SystemTime};

use serde::Serialize;
use smol_str::SmolStr;

use crate::bluetooth::transport::PeripheralId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionStatus {
   Discovered,
   Connected,
   Disconnected,
}

/// Signal strength reading in dBm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RssiSample {
   pub dbm: i16,
   pub at: SystemTime,
}

impl RssiSample {
   pub fn now(dbm: i16) -> Self {
      Self {
         dbm,
         at: SystemTime::now(),
      }
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeripheralRecord {
   pub id: PeripheralId,
   pub name: Option<SmolStr>,
   pub rssi: Option<RssiSample>,
   pub status: ConnectionStatus,
}

impl PeripheralRecord {
   pub const fn discovered(id: PeripheralId, name: Option<SmolStr>) -> Self {
      Self {
         id,
         name,
         rssi: None,
         status: ConnectionStatus::Discovered,
      }
   }

   pub fn display_name(&self) -> &str {
      self.name.as_deref().unwrap_or("Unknown Device")
   }
}

/// Append-only, insertion-ordered set of peripherals keyed by id.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
   records: Vec<PeripheralRecord>,
   index: HashMap<PeripheralId, usize>,
}

impl DeviceRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   /// Adds `record` unless its id is already known. Returns whether it was
   /// inserted; the first discovery of an id wins.
   pub fn upsert(&mut self, record: PeripheralRecord) -> bool {
      if self.index.contains_key(&record.id) {
         return false;
      }
      self.index.insert(record.id.clone(), self.records.len());
      self.records.push(record);
      true
   }

   /// Snapshot of all records in discovery order.
   pub fn list(&self) -> Vec<PeripheralRecord> {
      self.records.clone()
   }

   pub fn get(&self, id: &PeripheralId) -> Option<&PeripheralRecord> {
      self.index.get(id).map(|&i| &self.records[i])
   }

   pub fn contains(&self, id: &PeripheralId) -> bool {
      self.index.contains_key(id)
   }

   pub fn len(&self) -> usize {
      self.records.len()
   }

   pub fn is_empty(&self) -> bool {
      self.records.is_empty()
   }

   fn get_mut(&mut self, id: &PeripheralId) -> Option<&mut PeripheralRecord> {
      self.index.get(id).map(|&i| &mut self.records[i])
   }

   /// Marks `id` connected. Any other connected record is demoted so that at
   /// most one record is ever connected.
   pub fn mark_connected(&mut self, id: &PeripheralId) -> bool {
      if !self.contains(id) {
         return false;
      }
      for record in &mut self.records {
         if record.status == ConnectionStatus::Connected && record.id != *id {
            record.status = ConnectionStatus::Disconnected;
         }
      }
      if let Some(record) = self.get_mut(id) {
         record.status = ConnectionStatus::Connected;
      }
      true
   }

   pub fn mark_disconnected(&mut self, id: &PeripheralId) -> bool {
      match self.get_mut(id) {
         Some(record) => {
            record.status = ConnectionStatus::Disconnected;
            true
         },
         None => false,
      }
   }

   pub fn update_rssi(&mut self, id: &PeripheralId, sample: RssiSample) -> bool {
      match self.get_mut(id) {
         Some(record) => {
            record.rssi = Some(sample);
            true
         },
         None => false,
      }
   }

   pub fn connected(&self) -> Option<&PeripheralRecord> {
      self
         .records
         .iter()
         .find(|r| r.status == ConnectionStatus::Connected)
   }
}
