//! Single-peripheral BLE session: discovery bookkeeping, the connection
//! lifecycle and RSSI polling, driven by one actor.

pub mod manager;
pub mod registry;
pub mod rssi;
pub mod state;

pub use manager::SessionManager;
pub use registry::{ConnectionStatus, DeviceRegistry, PeripheralRecord, RssiSample};
pub use state::SessionState;
