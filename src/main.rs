//! BLE session console.
//!
//! Scans for peripherals, connects to one chosen from the list, sends text
//! to its writable characteristic and reports signal strength while the
//! link is up.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{
   io::{self, AsyncBufReadExt, BufReader},
   select, signal,
   sync::Notify,
   time,
};

use ble_session::{
   bluetooth::{bluez::BluezTransport, transport},
   config::Config,
   console::{self, Command, CommandError, Controls},
   error::{Result, SessionError},
   event::{EventBus, SessionEvent},
   session::SessionManager,
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting ble-session...");

   let config = Config::load()?;
   info!(
      "Loaded configuration (adapter: {}, RSSI every {} ms)",
      config.adapter.as_deref().unwrap_or("default"),
      config.rssi_poll_interval_ms
   );

   let (sink, transport_events) = transport::channel();
   let transport = BluezTransport::new(&config, sink).await?;
   let manager = SessionManager::spawn(config.session(), Arc::new(transport), transport_events);

   let event_bus = EventProcessor::new(config.json_events);
   manager.subscribe(event_bus.clone()).await?;
   event_bus.spawn_dispatcher();

   let result = select! {
      result = run_console(&manager) => result,
      _ = signal::ctrl_c() => Ok(()),
   };
   info!("Shutting down ble-session...");
   if let Err(e) = manager.shutdown().await {
      warn!("Session did not shut down cleanly: {e}");
   }

   result
}

async fn run_console(manager: &SessionManager) -> Result<()> {
   println!("{}", console::HELP);
   let mut lines = BufReader::new(io::stdin()).lines();

   while let Some(line) = lines.next_line().await? {
      let command = match line.parse::<Command>() {
         Ok(Command::Quit) => break,
         Ok(command) => command,
         Err(CommandError::Empty) => continue,
         Err(e) => {
            println!("{e}");
            continue;
         },
      };
      if let Err(e) = execute(manager, command).await {
         println!("{e}");
      }
   }

   Ok(())
}

async fn execute(
   manager: &SessionManager,
   command: Command,
) -> std::result::Result<(), SessionError> {
   let state = manager.state().await?;
   if let Some(reason) = Controls::from_state(state).deny(&command) {
      println!("Unavailable while {state}: {reason}");
      return Ok(());
   }

   match command {
      Command::Scan => manager.start_scan().await?,
      Command::Stop => manager.stop_scan().await?,
      Command::List => println!("{}", console::render_devices(&manager.devices().await)),
      Command::Connect(target) => match target.resolve(&manager.devices().await) {
         Some(id) => {
            println!("Connecting to {id}...");
            manager.connect(id).await?;
         },
         None => println!("No such device, see 'list'"),
      },
      Command::Disconnect => manager.disconnect().await?,
      Command::Send(text) => {
         let ticket = manager.send_text(&text).await?;
         println!("Queued {ticket}");
      },
      Command::State => println!("{state}"),
      Command::Help => println!("{}", console::HELP),
      Command::Quit => {},
   }
   Ok(())
}

struct EventProcessor {
   queue: SegQueue<SessionEvent>,
   notifier: Notify,
   json: bool,
}

impl EventProcessor {
   fn new(json: bool) -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
         json,
      })
   }

   async fn recv(self: &Arc<Self>) -> Option<SessionEvent> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   fn dispatch(&self, event: &SessionEvent) {
      if self.json {
         println!("{}", event.to_json());
      } else {
         println!("{}", console::render_event(event));
      }
   }

   fn spawn_dispatcher(self: Arc<Self>) {
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            self.dispatch(&event);
         }
      });
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: &SessionEvent) {
      self.queue.push(event.clone());
      self.notifier.notify_waiters();
   }
}
