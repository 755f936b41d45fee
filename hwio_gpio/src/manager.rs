use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use tracing::{debug, info, trace};

use crate::{
    backend::{GpioChip, LineInfo},
    group::GroupManager,
    monitor::{EdgeEvent, EdgeMonitor},
    pins::{Hardware, PinRegistry},
    pull::{self, PullController},
    BoardChip, ChipRegistry, EdgeKind, Error, GroupId, ManagerConfig, Pin, PinMode, PullMode,
    Result,
};

/// Receives edges during [`GpioPinManager::dispatch_edge_events`] and may
/// reconfigure pins through the manager it is handed.
pub type EdgeCallback = Box<dyn FnMut(&mut GpioPinManager, Pin, EdgeKind) + Send>;

enum Subscription {
    Vacant,
    Registered(EdgeCallback),
    /// The callback is running and temporarily moved out.
    InDispatch,
}

#[derive(Debug)]
struct AttachedChip {
    name: String,
    chip: Arc<dyn GpioChip>,
}

/// Pins, groups and edge events of one device driver on one chip.
///
/// # Examples
/// ```rust,no_run
/// # use hwio_gpio::{BoardChip, GpioPinManager, Pin};
/// let mut gpio = GpioPinManager::new().unwrap();
/// gpio.open_board_chip(BoardChip::Gpiochip0).unwrap();
/// gpio.set_pin_value(Pin::GPIO17, true).unwrap();
/// let pressed = gpio.get_pin_value(Pin::GPIO27).unwrap();
/// # let _ = pressed;
/// ```
pub struct GpioPinManager {
    config: ManagerConfig,
    registry: Arc<ChipRegistry>,
    pulls: Box<dyn PullController>,
    chip: Option<AttachedChip>,
    pins: PinRegistry,
    groups: GroupManager,
    monitor: EdgeMonitor,
    subscription: Subscription,
}

impl fmt::Debug for GpioPinManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpioPinManager")
            .field("config", &self.config)
            .field("chip", &self.chip_name())
            .field("pins", &self.pins)
            .field("groups", &self.groups)
            .field("edge_callback", &self.has_edge_callback())
            .finish_non_exhaustive()
    }
}

impl GpioPinManager {
    /// A manager on the process-wide registry, configured from the environment.
    pub fn new() -> Result<Self> {
        Self::with_config(ManagerConfig::from_env())
    }

    pub fn with_config(config: ManagerConfig) -> Result<Self> {
        let pulls = pull::detect(config.pull_device());
        Self::with_parts(config, ChipRegistry::global(), pulls)
    }

    /// A manager on an explicit registry and pull controller.
    pub fn with_parts(
        config: ManagerConfig,
        registry: Arc<ChipRegistry>,
        pulls: Box<dyn PullController>,
    ) -> Result<Self> {
        let monitor = EdgeMonitor::new(config.edge_timeout())?;
        Ok(Self {
            config,
            registry,
            pulls,
            chip: None,
            pins: PinRegistry::default(),
            groups: GroupManager::default(),
            monitor,
            subscription: Subscription::Vacant,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Attach to the chip called `name`.
    ///
    /// A manager holds at most one chip; opening a second time is an error
    /// even for the same name.
    pub fn open_chip(&mut self, name: &str) -> Result<()> {
        debug!(chip = name, "open_chip");
        if let Some(attached) = &self.chip {
            return Err(Error::ChipAlreadyOpen(attached.name.clone()));
        }
        let chip = self.registry.attach(name)?;
        self.chip = Some(AttachedChip {
            name: name.to_owned(),
            chip,
        });
        Ok(())
    }

    pub fn open_board_chip(&mut self, chip: BoardChip) -> Result<()> {
        self.open_chip(chip.name())
    }

    /// Release every group and pin, stop the edge monitor and detach from
    /// the chip. Does nothing when no chip is open.
    pub fn close(&mut self) {
        let Some(AttachedChip { name, chip }) = self.chip.take() else {
            return;
        };
        debug!(chip = %name, pins = self.pins.len(), groups = self.groups.len(), "close");

        self.monitor.stop();
        self.groups.clear(&mut self.pins);
        self.pins.close_all();
        while self.monitor.try_next().is_some() {}

        drop(chip);
        self.registry.detach(&name);
        info!(chip = %name, "Pin manager closed");
    }

    /// Whether this manager holds a chip, regardless of other managers.
    pub fn is_open(&self) -> bool {
        self.chip.is_some()
    }

    pub fn chip_name(&self) -> Option<&str> {
        self.chip.as_ref().map(|attached| attached.name.as_str())
    }

    fn split(&mut self) -> Result<(Hardware<'_>, &mut PinRegistry, &mut GroupManager)> {
        let attached = self.chip.as_ref().ok_or(Error::ChipNotOpen)?;
        let hw = Hardware {
            chip: attached.chip.as_ref(),
            pulls: self.pulls.as_ref(),
            consumer: self.config.consumer(),
        };
        Ok((hw, &mut self.pins, &mut self.groups))
    }

    fn reject_member(&self, pin: Pin) -> Result<()> {
        match self.pins.group_of(pin) {
            Some(group) => Err(Error::PinInGroup { pin, group }),
            None => Ok(()),
        }
    }

    /// Unwatch `pin` if it leaves edge-detection mode, `None` meaning close.
    fn leave_edge_mode(&self, pin: Pin, next: Option<PinMode>) {
        let leaving = self.pins.mode(pin) == Some(PinMode::EdgeDetection)
            && !matches!(next, Some(PinMode::EdgeDetection | PinMode::AsIs));
        if leaving {
            self.monitor.unwatch(pin);
        }
    }

    /// Bring the monitor's watch set in line with the registry for `pin`.
    fn sync_monitor<T>(&mut self, pin: Pin, result: Result<T>) -> Result<T> {
        let synced = match self.pins.edge_line(pin) {
            Some(line) => self.monitor.watch(pin, line).map_err(|e| {
                self.pins.discard(pin);
                e
            }),
            None => {
                self.monitor.unwatch(pin);
                Ok(())
            }
        };
        let value = result?;
        synced?;
        Ok(value)
    }

    /// Claim `pin` in `mode` with `pull`, or reconcile an existing claim.
    ///
    /// [`PinMode::AsIs`] and [`PullMode::AsIs`] keep the current setting.
    /// Edge detection needs a registered edge callback.
    pub fn open_pin(&mut self, pin: Pin, mode: PinMode, pull: PullMode) -> Result<()> {
        debug!(%pin, ?mode, ?pull, "open_pin");
        if mode == PinMode::EdgeDetection && !self.has_edge_callback() {
            return Err(Error::NoEdgeCallback);
        }
        self.leave_edge_mode(pin, Some(mode));
        let (hw, pins, _) = self.split()?;
        let result = pins.open(hw, pin, mode, pull, 0);
        self.sync_monitor(pin, result)
    }

    /// Release `pin`. Closing a pin that is not claimed does nothing.
    pub fn close_pin(&mut self, pin: Pin) -> Result<()> {
        debug!(%pin, "close_pin");
        self.reject_member(pin)?;
        self.leave_edge_mode(pin, None);
        let result = self.pins.close(pin);
        self.sync_monitor(pin, result)
    }

    /// Drive `pin`, claiming it as an output or switching it to output first.
    pub fn set_pin_value(&mut self, pin: Pin, high: bool) -> Result<()> {
        trace!(%pin, high, "set_pin_value");
        self.reject_member(pin)?;
        self.leave_edge_mode(pin, Some(PinMode::Output));
        let (hw, pins, _) = self.split()?;
        let result = pins
            .open(hw, pin, PinMode::Output, PullMode::AsIs, u8::from(high))
            .and_then(|()| pins.write(pin, high));
        self.sync_monitor(pin, result)
    }

    /// Sample `pin`, claiming it as an input or switching it to input first.
    pub fn get_pin_value(&mut self, pin: Pin) -> Result<bool> {
        trace!(%pin, "get_pin_value");
        self.reject_member(pin)?;
        self.leave_edge_mode(pin, Some(PinMode::Input));
        let (hw, pins, _) = self.split()?;
        let result = pins
            .open(hw, pin, PinMode::Input, PullMode::AsIs, 0)
            .and_then(|()| pins.read(pin));
        self.sync_monitor(pin, result)
    }

    /// Change the bias of `pin`. Unclaimed pins are configured without being
    /// claimed.
    pub fn set_pin_pull(&mut self, pin: Pin, pull: PullMode) -> Result<()> {
        debug!(%pin, ?pull, "set_pin_pull");
        if self.pins.is_claimed(pin) {
            self.pins.change_pull(self.pulls.as_ref(), pin, pull)
        } else {
            self.pulls.set_pull(pin, pull)
        }
    }

    /// Mode of a claimed pin, `None` when unclaimed.
    pub fn pin_mode(&self, pin: Pin) -> Option<PinMode> {
        self.pins.mode(pin)
    }

    /// Pull recorded for a claimed pin, `None` when unclaimed.
    pub fn pin_pull(&self, pin: Pin) -> Option<PullMode> {
        self.pins.pull(pin)
    }

    pub fn line_info(&self, pin: Pin) -> Result<LineInfo> {
        let attached = self.chip.as_ref().ok_or(Error::ChipNotOpen)?;
        attached.chip.line_info(pin.offset())
    }

    /// Claim `pins` as one group for bulk access. All or nothing.
    ///
    /// Values passed to [`set_group_values`](Self::set_group_values) and
    /// [`get_group_values`](Self::get_group_values) follow the order of
    /// `pins`.
    pub fn register_group(&mut self, pins: &[Pin]) -> Result<GroupId> {
        debug!(?pins, "register_group");
        let (hw, registry, groups) = self.split()?;
        groups.register(registry, hw, pins)
    }

    pub fn unregister_group(&mut self, id: GroupId) -> Result<()> {
        debug!(group = %id, "unregister_group");
        let Self { pins, groups, .. } = self;
        groups.unregister(pins, id)
    }

    pub fn set_group_values(&mut self, id: GroupId, values: &[u8]) -> Result<()> {
        trace!(group = %id, ?values, "set_group_values");
        let (hw, pins, groups) = self.split()?;
        groups.set_values(pins, hw, id, values)
    }

    pub fn get_group_values(&mut self, id: GroupId, values: &mut [u8]) -> Result<()> {
        trace!(group = %id, "get_group_values");
        let (hw, pins, groups) = self.split()?;
        groups.get_values(pins, hw, id, values)
    }

    pub fn group_pins(&self, id: GroupId) -> Option<&[Pin]> {
        self.groups.pins(id)
    }

    /// Set the edge callback, replacing any previous one.
    pub fn register_edge_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&mut GpioPinManager, Pin, EdgeKind) + Send + 'static,
    {
        debug!("register_edge_callback");
        self.subscription = Subscription::Registered(Box::new(callback));
    }

    /// Remove the edge callback. Pins stay in edge-detection mode and their
    /// events are dropped at dispatch.
    pub fn unregister_edge_callback(&mut self) {
        debug!("unregister_edge_callback");
        self.subscription = Subscription::Vacant;
    }

    pub fn has_edge_callback(&self) -> bool {
        !matches!(self.subscription, Subscription::Vacant)
    }

    pub fn is_edge_monitor_running(&self) -> bool {
        self.monitor.is_running()
    }

    /// Hand every queued edge to the callback without blocking.
    ///
    /// Returns the number of callback invocations. Calls made from inside the
    /// callback return 0.
    pub fn dispatch_edge_events(&mut self) -> usize {
        if matches!(self.subscription, Subscription::InDispatch) {
            return 0;
        }
        let mut delivered = 0;
        while let Some(event) = self.monitor.try_next() {
            if self.deliver(event) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Wait up to `timeout` for at least one edge, then dispatch everything
    /// queued.
    pub fn wait_edge_events(&mut self, timeout: Duration) -> usize {
        if matches!(self.subscription, Subscription::InDispatch) {
            return 0;
        }
        // No deadline means waiting without bound.
        let deadline = Instant::now().checked_add(timeout);
        loop {
            let remaining =
                deadline.map_or(timeout, |d| d.saturating_duration_since(Instant::now()));
            let Some(event) = self.monitor.next_timeout(remaining) else {
                return 0;
            };
            if self.deliver(event) {
                return 1 + self.dispatch_edge_events();
            }
        }
    }

    fn deliver(&mut self, event: EdgeEvent) -> bool {
        if self.pins.mode(event.pin) != Some(PinMode::EdgeDetection) {
            trace!(pin = %event.pin, "Dropping edge of a pin no longer in edge mode");
            return false;
        }
        match std::mem::replace(&mut self.subscription, Subscription::InDispatch) {
            Subscription::Registered(mut callback) => {
                callback(self, event.pin, event.kind);
                // The callback may have replaced or removed itself.
                if matches!(self.subscription, Subscription::InDispatch) {
                    self.subscription = Subscription::Registered(callback);
                }
                true
            }
            other => {
                trace!(pin = %event.pin, kind = ?event.kind, "No edge callback, event dropped");
                self.subscription = other;
                false
            }
        }
    }

    /// Clock `value` into a shift register, most significant bit first, and
    /// latch it.
    ///
    /// Produces eight rising edges on `clock` with `data` settled before
    /// each, followed by one rising edge on `latch`.
    pub fn shift_write(&mut self, value: u8, data: Pin, clock: Pin, latch: Pin) -> Result<()> {
        debug!(value, %data, %clock, %latch, "shift_write");
        if data == clock || data == latch {
            return Err(Error::DuplicatePin(data));
        }
        if clock == latch {
            return Err(Error::DuplicatePin(clock));
        }

        self.set_pin_value(clock, false)?;
        self.set_pin_value(latch, false)?;
        for bit in (0..8).rev() {
            self.set_pin_value(data, value & (1 << bit) != 0)?;
            self.set_pin_value(clock, true)?;
            self.set_pin_value(clock, false)?;
        }
        self.set_pin_value(latch, true)
    }
}

impl Drop for GpioPinManager {
    fn drop(&mut self) {
        self.close();
    }
}
