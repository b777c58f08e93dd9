//! Line-oriented console front end.
//!
//! Parses user commands and renders session events. Which commands are
//! available is derived from the session state alone, see [`Controls`].

use std::{fmt::Write as _, str::FromStr};

use smol_str::SmolStr;
use thiserror::Error;

use crate::{
   bluetooth::transport::{AdapterState, PeripheralId},
   event::SessionEvent,
   session::{PeripheralRecord, SessionState},
};

pub const HELP: &str = "\
Commands:
  scan                 start scanning for peripherals
  stop                 stop scanning
  list                 show discovered peripherals
  connect <row|id>     connect to a listed peripheral
  disconnect           drop the current connection
  send <text>          write text to the connected peripheral
  state                show the session state
  help                 show this help
  quit                 exit";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
   #[error("Empty command")]
   Empty,

   #[error("Unknown command: {0} (try 'help')")]
   Unknown(SmolStr),

   #[error("'{0}' needs an argument")]
   MissingArgument(&'static str),
}

/// Peripheral selection for `connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
   /// 1-based row of the `list` output.
   Row(usize),
   Id(PeripheralId),
}

impl Target {
   /// Resolves the target against the current device listing.
   pub fn resolve(&self, devices: &[PeripheralRecord]) -> Option<PeripheralId> {
      match self {
         Self::Row(row) => row
            .checked_sub(1)
            .and_then(|i| devices.get(i))
            .map(|record| record.id.clone()),
         Self::Id(id) => Some(id.clone()),
      }
   }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
   Scan,
   Stop,
   List,
   Connect(Target),
   Disconnect,
   Send(String),
   State,
   Help,
   Quit,
}

impl FromStr for Command {
   type Err = CommandError;

   fn from_str(line: &str) -> Result<Self, Self::Err> {
      let line = line.trim();
      let (word, rest) = line
         .split_once(char::is_whitespace)
         .map_or((line, ""), |(w, r)| (w, r.trim_start()));

      let command = match word.to_ascii_lowercase().as_str() {
         "" => return Err(CommandError::Empty),
         "scan" => Self::Scan,
         "stop" => Self::Stop,
         "list" | "ls" => Self::List,
         "connect" => {
            let arg = rest.trim();
            if arg.is_empty() {
               return Err(CommandError::MissingArgument("connect"));
            }
            match arg.parse::<usize>() {
               Ok(row) => Self::Connect(Target::Row(row)),
               Err(_) => Self::Connect(Target::Id(PeripheralId::from(arg))),
            }
         },
         "disconnect" => Self::Disconnect,
         "send" => {
            // Text is sent as typed, inner whitespace included
            if rest.is_empty() {
               return Err(CommandError::MissingArgument("send"));
            }
            Self::Send(rest.to_owned())
         },
         "state" => Self::State,
         "help" | "?" => Self::Help,
         "quit" | "exit" => Self::Quit,
         _ => return Err(CommandError::Unknown(word.into())),
      };
      Ok(command)
   }
}

/// Which user actions make sense in a given session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls {
   pub scan: bool,
   pub connect: bool,
   pub disconnect: bool,
   pub send: bool,
}

impl Controls {
   pub const fn from_state(state: SessionState) -> Self {
      Self {
         scan: !matches!(state, SessionState::Scanning),
         connect: state.can_connect(),
         disconnect: matches!(state, SessionState::Connecting | SessionState::Connected),
         send: matches!(state, SessionState::Connected),
      }
   }

   /// Returns the reason `command` is unavailable, if it is.
   pub const fn deny(self, command: &Command) -> Option<&'static str> {
      match command {
         Command::Connect(_) if !self.connect => Some("disconnect first"),
         Command::Disconnect if !self.disconnect => Some("not connected"),
         Command::Send(_) if !self.send => Some("not connected"),
         _ => None,
      }
   }
}

/// Formats the device table printed by `list`.
pub fn render_devices(devices: &[PeripheralRecord]) -> String {
   if devices.is_empty() {
      return "No devices discovered yet".to_owned();
   }
   let mut out = String::new();
   for (row, record) in devices.iter().enumerate() {
      let rssi = record
         .rssi
         .map_or_else(|| "   -".to_owned(), |s| format!("{:4}", s.dbm));
      let _ = writeln!(
         out,
         "{:>3}  {:<17}  {rssi} dBm  {:<12}  {}",
         row + 1,
         record.id,
         record.status,
         record.display_name()
      );
   }
   out.truncate(out.trim_end().len());
   out
}

/// Human-readable one-liner for an event.
pub fn render_event(event: &SessionEvent) -> String {
   match event {
      SessionEvent::AdapterStateChanged(AdapterState::PoweredOn) => {
         "Bluetooth is on".to_owned()
      },
      SessionEvent::AdapterStateChanged(state) => format!("Bluetooth unavailable ({state})"),
      SessionEvent::DeviceDiscovered(record) => {
         format!("Discovered {} ({})", record.display_name(), record.id)
      },
      SessionEvent::StateChanged { old, new } => format!("State: {old} -> {new}"),
      SessionEvent::DiscoveryCompleted { id, writable: Some(c) } => {
         format!("{id} ready, writing to {c}")
      },
      SessionEvent::DiscoveryCompleted { id, writable: None } => {
         format!("{id} has no writable characteristic")
      },
      SessionEvent::RssiUpdated { id, sample } => format!("RSSI {id}: {} dBm", sample.dbm),
      SessionEvent::SendCompleted { ticket, result: Ok(()) } => format!("Sent {ticket}"),
      SessionEvent::SendCompleted { ticket, result: Err(e) } => format!("Send {ticket} failed: {e}"),
      SessionEvent::ErrorReported(e) => format!("Error: {e}"),
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::session::{ConnectionStatus, RssiSample};

   #[test]
   fn test_parse_commands() {
      assert_eq!("scan".parse::<Command>(), Ok(Command::Scan));
      assert_eq!("  LIST ".parse::<Command>(), Ok(Command::List));
      assert_eq!(
         "connect 2".parse::<Command>(),
         Ok(Command::Connect(Target::Row(2)))
      );
      assert_eq!(
         "connect AA:BB:CC:DD:EE:FF".parse::<Command>(),
         Ok(Command::Connect(Target::Id("AA:BB:CC:DD:EE:FF".into())))
      );
      assert_eq!(
         "send hello  world".parse::<Command>(),
         Ok(Command::Send("hello  world".to_owned()))
      );
   }

   #[test]
   fn test_parse_errors() {
      assert_eq!("".parse::<Command>(), Err(CommandError::Empty));
      assert_eq!(
         "connect".parse::<Command>(),
         Err(CommandError::MissingArgument("connect"))
      );
      assert_eq!(
         "send   ".parse::<Command>(),
         Err(CommandError::MissingArgument("send"))
      );
      assert_eq!(
         "fly away".parse::<Command>(),
         Err(CommandError::Unknown("fly".into()))
      );
   }

   #[test]
   fn test_controls_follow_state() {
      let idle = Controls::from_state(SessionState::Idle);
      assert!(idle.connect && idle.scan);
      assert!(!idle.disconnect && !idle.send);

      let connecting = Controls::from_state(SessionState::Connecting);
      assert!(!connecting.connect && connecting.disconnect && !connecting.send);

      let connected = Controls::from_state(SessionState::Connected);
      assert!(!connected.connect && connected.disconnect && connected.send);

      for state in [SessionState::Disconnecting, SessionState::Error] {
         let controls = Controls::from_state(state);
         assert!(!controls.connect && !controls.disconnect && !controls.send);
      }

      assert_eq!(
         connected.deny(&Command::Connect(Target::Row(1))),
         Some("disconnect first")
      );
      assert_eq!(connected.deny(&Command::Send("x".into())), None);
   }

   #[test]
   fn test_row_resolution() {
      let devices = vec![
         PeripheralRecord::discovered("a".into(), Some("Alpha".into())),
         PeripheralRecord::discovered("b".into(), None),
      ];
      assert_eq!(Target::Row(2).resolve(&devices), Some("b".into()));
      assert_eq!(Target::Row(0).resolve(&devices), None);
      assert_eq!(Target::Row(3).resolve(&devices), None);
   }

   #[test]
   fn test_render_devices() {
      let mut named = PeripheralRecord::discovered("a".into(), Some("Alpha".into()));
      named.rssi = Some(RssiSample::now(-60));
      named.status = ConnectionStatus::Connected;
      let devices = vec![named, PeripheralRecord::discovered("b".into(), None)];

      let table = render_devices(&devices);
      let lines: Vec<_> = table.lines().collect();
      assert_eq!(lines.len(), 2);
      assert!(lines[0].contains("Alpha") && lines[0].contains("-60"));
      assert!(lines[1].contains("Unknown Device"));
      assert_eq!(render_devices(&[]), "No devices discovered yet");
   }
}
