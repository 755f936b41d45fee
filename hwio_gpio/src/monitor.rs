//! Background thread waiting for edges on every pin in edge-detection mode.
//!
//! The thread owns no pin state. It polls a snapshot of the watched lines,
//! taken afresh each cycle, and sends what it reads over a channel that the
//! control thread drains through
//! [`GpioPinManager::dispatch_edge_events`](crate::GpioPinManager::dispatch_edge_events).

use std::{
    collections::BTreeMap,
    os::fd::{AsFd, BorrowedFd},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use crate::{
    backend::{EdgeLine, EdgeReading},
    sys::{poll_readable, Pipe},
    EdgeKind, Pin, Result,
};

const THREAD_NAME: &str = "gpio-edge-monitor";

/// One edge seen on a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeEvent {
    pub pin: Pin,
    pub kind: EdgeKind,
}

#[derive(Debug, Default)]
struct WatchState {
    lines: BTreeMap<Pin, Arc<dyn EdgeLine>>,
    running: bool,
    /// Bumped by the thread each time it has dropped its previous snapshot.
    cycle: u64,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<WatchState>,
    released: Condvar,
    /// Interrupts the wait when the watch set changes.
    waker: Pipe,
}

impl Shared {
    fn wake(&self) {
        if let Err(e) = self.waker.notify() {
            warn!(error = %e, "Failed to wake the edge monitor");
        }
    }
}

#[derive(Debug)]
pub(crate) struct EdgeMonitor {
    timeout: Duration,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    tx: Sender<EdgeEvent>,
    rx: Receiver<EdgeEvent>,
}

impl EdgeMonitor {
    pub(crate) fn new(timeout: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        Ok(Self {
            timeout,
            shared: Arc::new(Shared {
                state: Mutex::new(WatchState::default()),
                released: Condvar::new(),
                waker: Pipe::new()?,
            }),
            thread: None,
            tx,
            rx,
        })
    }

    /// Watch `line` for `pin`, starting the thread if it is not running.
    pub(crate) fn watch(&mut self, pin: Pin, line: Arc<dyn EdgeLine>) -> Result<()> {
        let mut state = self.shared.state.lock();
        if let Some(current) = state.lines.get(&pin) {
            if Arc::ptr_eq(current, &line) {
                return Ok(());
            }
        }
        state.lines.insert(pin, line);
        trace!(%pin, watched = state.lines.len(), "Watching pin");

        if state.running {
            drop(state);
            self.shared.wake();
            return Ok(());
        }

        // A previous thread has already seen an empty set and is exiting.
        state.running = true;
        drop(state);
        self.join();

        let shared = Arc::clone(&self.shared);
        let tx = self.tx.clone();
        let timeout = self.timeout;
        let spawned = thread::Builder::new()
            .name(THREAD_NAME.to_owned())
            .spawn(move || run(&shared, &tx, timeout));
        match spawned {
            Ok(handle) => {
                debug!(?timeout, "Edge monitor started");
                self.thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                let mut state = self.shared.state.lock();
                state.running = false;
                state.lines.remove(&pin);
                Err(e.into())
            }
        }
    }

    /// Stop watching `pin` and wait until the thread no longer holds its line,
    /// so the line can be requested again right away.
    pub(crate) fn unwatch(&self, pin: Pin) {
        let mut state = self.shared.state.lock();
        let Some(line) = state.lines.remove(&pin) else {
            return;
        };
        trace!(%pin, "Stopped watching pin");
        if state.running {
            let target = state.cycle + 1;
            self.shared.wake();
            while state.running && state.cycle < target {
                let timed_out = self
                    .shared
                    .released
                    .wait_for(&mut state, self.timeout.saturating_mul(2))
                    .timed_out();
                if timed_out {
                    warn!(%pin, "Edge monitor did not release the line in time");
                    break;
                }
            }
        }
        drop(state);
        drop(line);
    }

    /// Empty the watch set and wait for the thread to exit.
    pub(crate) fn stop(&mut self) {
        let watched = std::mem::take(&mut self.shared.state.lock().lines);
        if !watched.is_empty() {
            self.shared.wake();
        }
        drop(watched);
        self.join();
    }

    fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!("Edge monitor thread panicked");
                self.shared.state.lock().running = false;
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.shared.state.lock().running
    }

    pub(crate) fn is_watching(&self, pin: Pin) -> bool {
        self.shared.state.lock().lines.contains_key(&pin)
    }

    pub(crate) fn try_next(&self) -> Option<EdgeEvent> {
        self.rx.try_recv().ok()
    }

    pub(crate) fn next_timeout(&self, timeout: Duration) -> Option<EdgeEvent> {
        self.rx.recv_timeout(timeout).ok()
    }
}

impl Drop for EdgeMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &Shared, tx: &Sender<EdgeEvent>, timeout: Duration) {
    let mut readings: Vec<(EdgeReading, Pin)> = Vec::new();
    let mut watched: Vec<(Pin, Arc<dyn EdgeLine>)> = Vec::new();
    loop {
        watched.clear();
        {
            let mut state = shared.state.lock();
            state.cycle += 1;
            shared.released.notify_all();
            if state.lines.is_empty() {
                state.running = false;
                debug!("No pins left in edge mode, edge monitor exiting");
                return;
            }
            watched.extend(
                state
                    .lines
                    .iter()
                    .map(|(pin, line)| (*pin, Arc::clone(line))),
            );
        }

        let mut fds: Vec<BorrowedFd<'_>> = Vec::with_capacity(watched.len() + 1);
        fds.push(shared.waker.reader());
        fds.extend(watched.iter().map(|(_, line)| line.as_fd()));

        let ready = match poll_readable(&fds, timeout) {
            Ok(ready) => ready,
            Err(e) => {
                error!(error = %e, "Edge wait failed");
                thread::sleep(timeout.min(Duration::from_millis(100)));
                continue;
            }
        };
        if ready[0] {
            shared.waker.drain();
        }

        for ((pin, line), _) in watched.iter().zip(&ready[1..]).filter(|(_, ready)| **ready) {
            match line.read_event() {
                Ok(reading) => readings.push((reading, *pin)),
                Err(e) => warn!(%pin, error = %e, "Failed to read edge event"),
            }
        }

        readings.sort_by_key(|(reading, _)| reading.timestamp_ns);
        for (reading, pin) in readings.drain(..) {
            trace!(%pin, kind = ?reading.kind, "Edge");
            let event = EdgeEvent {
                pin,
                kind: reading.kind,
            };
            if tx.send(event).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::{
        backend::{ChipProvider, GpioChip},
        sim::{SimChipHandle, SimProvider},
    };

    fn setup() -> (SimChipHandle, Arc<dyn GpioChip>, EdgeMonitor) {
        let provider = SimProvider::new();
        let sim = provider.add_chip("gpiochip0", 8);
        let chip = provider.open("gpiochip0").unwrap();
        (sim, chip, EdgeMonitor::new(Duration::from_secs(5)).unwrap())
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn events_arrive_in_timestamp_order() {
        let (sim, chip, mut monitor) = setup();
        let a = chip.request_edge_events(1, "test").unwrap();
        let b = chip.request_edge_events(2, "test").unwrap();
        monitor.watch(Pin::GPIO02, b).unwrap();
        monitor.watch(Pin::GPIO01, a).unwrap();
        assert!(monitor.is_running());

        assert!(sim.inject_edge(2, EdgeKind::Rising));
        assert!(sim.inject_edge(1, EdgeKind::Falling));

        let first = monitor.next_timeout(Duration::from_secs(5)).unwrap();
        let second = monitor.next_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            (first, second),
            (
                EdgeEvent { pin: Pin::GPIO02, kind: EdgeKind::Rising },
                EdgeEvent { pin: Pin::GPIO01, kind: EdgeKind::Falling },
            )
        );
    }

    #[test]
    fn thread_exits_once_nothing_is_watched() {
        let (sim, chip, mut monitor) = setup();
        let line = chip.request_edge_events(3, "test").unwrap();
        monitor.watch(Pin::GPIO03, line).unwrap();
        monitor.unwatch(Pin::GPIO03);

        // The wake pipe cuts the five second wait short.
        assert!(wait_until(|| !monitor.is_running()));
        assert!(wait_until(|| sim.stats().edge_releases == 1));

        let line = chip.request_edge_events(3, "test").unwrap();
        monitor.watch(Pin::GPIO03, line).unwrap();
        assert!(monitor.is_running());
        assert!(sim.inject_edge(3, EdgeKind::Rising));
        assert_eq!(
            monitor.next_timeout(Duration::from_secs(5)).map(|e| e.kind),
            Some(EdgeKind::Rising)
        );
    }

    #[test]
    fn stop_joins_the_thread() {
        let (sim, chip, mut monitor) = setup();
        let line = chip.request_edge_events(4, "test").unwrap();
        monitor.watch(Pin::GPIO04, line).unwrap();
        monitor.stop();
        assert!(!monitor.is_running());
        assert!(!monitor.is_watching(Pin::GPIO04));
        assert_eq!(sim.stats().edge_releases, 1);
    }
}
