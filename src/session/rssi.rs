//! Periodic RSSI polling for the connected peripheral.
//!
//! The poller only produces ticks; the session actor turns them into
//! transport reads. Each start bumps an epoch so that ticks and results from
//! an earlier run are recognised and dropped.

use std::time::Duration;

use log::debug;
use tokio::{
   sync::mpsc,
   task::JoinHandle,
   time::{self, Instant, MissedTickBehavior},
};

use crate::bluetooth::transport::Ticket;

/// Timer tick, tagged with the run that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerTick {
   pub epoch: u64,
}

/// What the actor should do with a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
   /// Issue a read tagged with the given ticket.
   Read(Ticket),
   /// A read is still in flight; this tick is folded into it.
   Coalesced,
   /// The tick belongs to a stopped run.
   Stale,
}

#[derive(Debug)]
pub struct RssiPoller {
   period: Duration,
   epoch: u64,
   running: bool,
   handle: Option<JoinHandle<()>>,
   in_flight: Option<Ticket>,
}

impl RssiPoller {
   pub const fn new(period: Duration) -> Self {
      Self {
         period,
         epoch: 0,
         running: false,
         handle: None,
         in_flight: None,
      }
   }

   pub const fn is_running(&self) -> bool {
      self.running
   }

   /// Identifies the current run; bumped on every stop.
   pub const fn epoch(&self) -> u64 {
      self.epoch
   }

   /// Starts a new run delivering ticks to `ticks`. The first tick fires one
   /// period after the start.
   pub fn start(&mut self, ticks: mpsc::Sender<PollerTick>) {
      self.stop();
      self.running = true;
      let tick = PollerTick { epoch: self.epoch };
      let period = self.period;

      self.handle = Some(tokio::spawn(async move {
         let mut interval = time::interval_at(Instant::now() + period, period);
         interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
         loop {
            interval.tick().await;
            if ticks.send(tick).await.is_err() {
               break;
            }
         }
      }));
      debug!("RSSI poller started (epoch {})", self.epoch);
   }

   /// Cancels the timer and forgets any in-flight read.
   pub fn stop(&mut self) {
      if let Some(handle) = self.handle.take() {
         handle.abort();
      }
      if self.running {
         debug!("RSSI poller stopped (epoch {})", self.epoch);
      }
      self.running = false;
      self.in_flight = None;
      self.epoch += 1;
   }

   /// Decides whether `tick` should trigger a read; `ticket` is used if so.
   pub fn on_tick(&mut self, tick: PollerTick, ticket: Ticket) -> TickOutcome {
      if !self.running || tick.epoch != self.epoch {
         return TickOutcome::Stale;
      }
      if self.in_flight.is_some() {
         return TickOutcome::Coalesced;
      }
      self.in_flight = Some(ticket);
      TickOutcome::Read(ticket)
   }

   /// Accepts the result for `ticket` if it is the read this run is waiting
   /// on.
   pub fn complete(&mut self, ticket: Ticket) -> bool {
      if self.running && self.in_flight == Some(ticket) {
         self.in_flight = None;
         true
      } else {
         false
      }
   }
}

impl Drop for RssiPoller {
   fn drop(&mut self) {
      if let Some(handle) = self.handle.take() {
         handle.abort();
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const PERIOD: Duration = Duration::from_millis(10);

   #[tokio::test]
   async fn test_ticks_are_delivered_after_start() {
      let (tx, mut rx) = mpsc::channel(4);
      let mut poller = RssiPoller::new(PERIOD);
      poller.start(tx);

      let tick = time::timeout(Duration::from_secs(2), rx.recv())
         .await
         .expect("no tick within timeout")
         .expect("tick channel closed");
      assert_eq!(poller.on_tick(tick, Ticket(1)), TickOutcome::Read(Ticket(1)));
   }

   #[tokio::test]
   async fn test_inflight_read_coalesces_ticks() {
      let (tx, _rx) = mpsc::channel(4);
      let mut poller = RssiPoller::new(PERIOD);
      poller.start(tx);
      let tick = PollerTick { epoch: poller.epoch };

      assert_eq!(poller.on_tick(tick, Ticket(1)), TickOutcome::Read(Ticket(1)));
      assert_eq!(poller.on_tick(tick, Ticket(2)), TickOutcome::Coalesced);
      assert!(!poller.complete(Ticket(2)));
      assert!(poller.complete(Ticket(1)));
      assert_eq!(poller.on_tick(tick, Ticket(3)), TickOutcome::Read(Ticket(3)));
   }

   #[tokio::test]
   async fn test_stop_discards_late_ticks_and_results() {
      let (tx, _rx) = mpsc::channel(4);
      let mut poller = RssiPoller::new(PERIOD);
      poller.start(tx.clone());
      let old_tick = PollerTick { epoch: poller.epoch };
      assert_eq!(poller.on_tick(old_tick, Ticket(1)), TickOutcome::Read(Ticket(1)));

      poller.stop();
      assert!(!poller.is_running());
      assert_eq!(poller.on_tick(old_tick, Ticket(2)), TickOutcome::Stale);
      assert!(!poller.complete(Ticket(1)));

      // A fresh run does not accept the previous run's ticks either
      poller.start(tx);
      assert_eq!(poller.on_tick(old_tick, Ticket(3)), TickOutcome::Stale);
      assert!(!poller.complete(Ticket(1)));
   }

   #[tokio::test]
   async fn test_stopped_timer_stops_sending() {
      let (tx, mut rx) = mpsc::channel(16);
      let mut poller = RssiPoller::new(PERIOD);
      poller.start(tx);
      poller.stop();

      // Only the sender inside the aborted task held the channel open
      let next = time::timeout(Duration::from_secs(2), rx.recv()).await;
      assert_eq!(next.ok().flatten(), None);
   }
}
