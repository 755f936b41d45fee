use std::{collections::BTreeMap, sync::Arc};

use nix::errno::Errno;
use tracing::{debug, trace, warn};

use crate::{
    backend::{Direction, EdgeLine, GpioChip, LineHandle},
    error::inconsistent,
    pull::PullController,
    Error, GroupId, Pin, PinMode, PullMode, Result,
};

/// What a pin or group operation needs from the manager.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Hardware<'a> {
    pub(crate) chip: &'a dyn GpioChip,
    pub(crate) pulls: &'a dyn PullController,
    pub(crate) consumer: &'a str,
}

/// Native resource behind a claimed pin.
#[derive(Debug)]
enum PinLine {
    Line(Box<dyn LineHandle>),
    Edge(Arc<dyn EdgeLine>),
    /// The line is held by the bulk handle of a group.
    Grouped,
}

#[derive(Debug)]
struct PinEntry {
    line: PinLine,
    mode: PinMode,
    pull: PullMode,
    group: Option<GroupId>,
}

/// The pins claimed by one manager.
#[derive(Debug, Default)]
pub(crate) struct PinRegistry {
    pins: BTreeMap<Pin, PinEntry>,
}

impl PinRegistry {
    /// Claim `pin` or reconcile an existing claim with `mode` and `pull`.
    ///
    /// [`PinMode::AsIs`] and [`PullMode::AsIs`] leave the respective aspect
    /// untouched. `level` is the initial level for output requests.
    pub(crate) fn open(
        &mut self,
        hw: Hardware<'_>,
        pin: Pin,
        mode: PinMode,
        pull: PullMode,
        level: u8,
    ) -> Result<()> {
        let chip = hw.chip;
        if pin.offset() >= chip.num_lines() {
            return Err(Error::PinOutOfRange {
                pin,
                chip: chip.name().to_owned(),
                lines: chip.num_lines(),
            });
        }
        if mode == PinMode::Unknown {
            return Err(Error::InvalidMode { pin, mode });
        }

        if !self.pins.contains_key(&pin) {
            hw.pulls.set_pull(pin, pull)?;
            let line = request(hw, pin, mode, level)?;
            debug!(%pin, ?mode, ?pull, "Pin claimed");
            self.pins.insert(
                pin,
                PinEntry {
                    line,
                    mode,
                    pull,
                    group: None,
                },
            );
            return Ok(());
        }
        let Some(entry) = self.pins.get_mut(&pin) else {
            return Err(inconsistent("claimed pin vanished"));
        };

        let direction_changes = mode != PinMode::AsIs && mode != entry.mode;
        if let (Some(group), true) = (entry.group, direction_changes) {
            return Err(Error::PinInGroup { pin, group });
        }
        if pull != PullMode::AsIs && pull != entry.pull {
            hw.pulls.set_pull(pin, pull)?;
            entry.pull = pull;
            debug!(%pin, ?pull, "Pull changed");
        }
        if direction_changes {
            self.change_mode(hw, pin, mode, level)?;
        } else {
            trace!(%pin, ?mode, "Pin already in requested mode");
        }
        Ok(())
    }

    /// Release and re-request the line of `pin` in `mode`. The pin is closed
    /// if the new request fails.
    fn change_mode(&mut self, hw: Hardware<'_>, pin: Pin, mode: PinMode, level: u8) -> Result<()> {
        let Some(PinEntry {
            line,
            mode: previous,
            pull,
            group,
        }) = self.pins.remove(&pin)
        else {
            return Err(inconsistent("mode change of an unclaimed pin"));
        };
        // The kernel refuses a second request while the old one is alive.
        drop(line);

        match request(hw, pin, mode, level) {
            Ok(line) => {
                debug!(%pin, from = ?previous, to = ?mode, "Pin mode changed");
                self.pins.insert(
                    pin,
                    PinEntry {
                        line,
                        mode,
                        pull,
                        group,
                    },
                );
                Ok(())
            }
            Err(e) => {
                warn!(%pin, to = ?mode, error = %e, "Mode change failed, pin closed");
                Err(e)
            }
        }
    }

    pub(crate) fn change_pull(
        &mut self,
        pulls: &dyn PullController,
        pin: Pin,
        pull: PullMode,
    ) -> Result<()> {
        let Some(entry) = self.pins.get_mut(&pin) else {
            return Err(inconsistent("pull change of an unclaimed pin"));
        };
        if pull != PullMode::AsIs && pull != entry.pull {
            pulls.set_pull(pin, pull)?;
            entry.pull = pull;
            debug!(%pin, ?pull, "Pull changed");
        }
        Ok(())
    }

    /// Release `pin`. Closing an unclaimed pin does nothing.
    pub(crate) fn close(&mut self, pin: Pin) -> Result<()> {
        if let Some(group) = self.group_of(pin) {
            return Err(Error::PinInGroup { pin, group });
        }
        if self.pins.remove(&pin).is_some() {
            debug!(%pin, "Pin released");
        }
        Ok(())
    }

    /// Release `pin` regardless of group membership.
    pub(crate) fn discard(&mut self, pin: Pin) {
        if self.pins.remove(&pin).is_some() {
            trace!(%pin, "Pin discarded");
        }
    }

    pub(crate) fn close_all(&mut self) {
        let count = self.pins.len();
        self.pins.clear();
        if count > 0 {
            debug!(count, "Released all pins");
        }
    }

    pub(crate) fn write(&self, pin: Pin, high: bool) -> Result<()> {
        self.plain_line(pin, PinMode::Output)?
            .set_values(&[u8::from(high)])
    }

    pub(crate) fn read(&self, pin: Pin) -> Result<bool> {
        let mut value = [0u8];
        self.plain_line(pin, PinMode::Input)?.get_values(&mut value)?;
        Ok(value[0] != 0)
    }

    fn plain_line(&self, pin: Pin, mode: PinMode) -> Result<&dyn LineHandle> {
        let Some(entry) = self.pins.get(&pin) else {
            return Err(inconsistent("value access on an unclaimed pin"));
        };
        match &entry.line {
            PinLine::Line(line) if entry.mode == mode => Ok(line.as_ref()),
            _ => Err(inconsistent("value access on a pin in the wrong mode")),
        }
    }

    pub(crate) fn is_claimed(&self, pin: Pin) -> bool {
        self.pins.contains_key(&pin)
    }

    pub(crate) fn mode(&self, pin: Pin) -> Option<PinMode> {
        self.pins.get(&pin).map(|entry| entry.mode)
    }

    pub(crate) fn pull(&self, pin: Pin) -> Option<PullMode> {
        self.pins.get(&pin).map(|entry| entry.pull)
    }

    pub(crate) fn group_of(&self, pin: Pin) -> Option<GroupId> {
        self.pins.get(&pin).and_then(|entry| entry.group)
    }

    pub(crate) fn edge_line(&self, pin: Pin) -> Option<Arc<dyn EdgeLine>> {
        match &self.pins.get(&pin)?.line {
            PinLine::Edge(line) => Some(Arc::clone(line)),
            _ => None,
        }
    }

    /// Hand the line of `pin` over to `group`. The individual handle is
    /// released so the group can request all members at once.
    pub(crate) fn join_group(&mut self, pin: Pin, group: GroupId, mode: PinMode) -> Result<()> {
        let Some(entry) = self.pins.get_mut(&pin) else {
            return Err(inconsistent("group member is not claimed"));
        };
        entry.line = PinLine::Grouped;
        entry.mode = mode;
        entry.group = Some(group);
        Ok(())
    }

    /// Record the direction a group switched its members to.
    pub(crate) fn set_member_mode(&mut self, pin: Pin, mode: PinMode) -> Result<()> {
        match self.pins.get_mut(&pin) {
            Some(entry) if entry.group.is_some() => {
                entry.mode = mode;
                Ok(())
            }
            _ => Err(inconsistent("group member missing from the pin registry")),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.pins.len()
    }
}

fn request(hw: Hardware<'_>, pin: Pin, mode: PinMode, level: u8) -> Result<PinLine> {
    let Hardware { chip, consumer, .. } = hw;
    let offset = pin.offset();
    let result = match mode {
        PinMode::EdgeDetection => chip.request_edge_events(offset, consumer).map(PinLine::Edge),
        PinMode::Input => chip
            .request_lines(&[offset], Direction::Input, &[], consumer)
            .map(PinLine::Line),
        PinMode::Output => chip
            .request_lines(&[offset], Direction::Output, &[level], consumer)
            .map(PinLine::Line),
        PinMode::AsIs => chip
            .request_lines(&[offset], Direction::AsIs, &[], consumer)
            .map(PinLine::Line),
        PinMode::Unknown => return Err(Error::InvalidMode { pin, mode }),
    };
    result.map_err(|e| busy_to_owner(chip, pin, e))
}

/// Turn an `EBUSY` from the kernel into [`Error::LineBusy`] naming the holder.
pub(crate) fn busy_to_owner(chip: &dyn GpioChip, pin: Pin, err: Error) -> Error {
    let busy = matches!(
        err,
        Error::Uapi(lib_uapi::Error::Ioctl {
            source: Errno::EBUSY,
            ..
        })
    );
    if !busy {
        return err;
    }
    match chip.line_info(pin.offset()) {
        Ok(info) => Error::LineBusy {
            pin,
            consumer: info.consumer,
        },
        Err(_) => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::ChipProvider,
        pull::NoPullControl,
        sim::{SimChipHandle, SimProvider},
    };

    fn chip() -> (SimChipHandle, Arc<dyn GpioChip>) {
        let provider = SimProvider::new();
        let sim = provider.add_chip("gpiochip0", 16);
        (sim, provider.open("gpiochip0").unwrap())
    }

    fn hw(chip: &Arc<dyn GpioChip>) -> Hardware<'_> {
        Hardware {
            chip: chip.as_ref(),
            pulls: &NoPullControl,
            consumer: "test",
        }
    }

    fn open(
        pins: &mut PinRegistry,
        chip: &Arc<dyn GpioChip>,
        pin: Pin,
        mode: PinMode,
    ) -> Result<()> {
        pins.open(hw(chip), pin, mode, PullMode::AsIs, 0)
    }

    #[test]
    fn reopening_in_the_same_mode_is_idempotent() {
        let (sim, chip) = chip();
        let mut pins = PinRegistry::default();
        open(&mut pins, &chip, Pin::GPIO04, PinMode::Input).unwrap();
        open(&mut pins, &chip, Pin::GPIO04, PinMode::Input).unwrap();
        open(&mut pins, &chip, Pin::GPIO04, PinMode::AsIs).unwrap();
        assert_eq!(sim.stats().line_requests, 1);
        assert_eq!(pins.mode(Pin::GPIO04), Some(PinMode::Input));
    }

    #[test]
    fn mode_change_releases_then_requests_once() {
        let (sim, chip) = chip();
        let mut pins = PinRegistry::default();
        open(&mut pins, &chip, Pin::GPIO04, PinMode::Input).unwrap();
        open(&mut pins, &chip, Pin::GPIO04, PinMode::Output).unwrap();
        let stats = sim.stats();
        assert_eq!(stats.line_requests, 2);
        assert_eq!(stats.line_releases, 1);
        assert_eq!(pins.mode(Pin::GPIO04), Some(PinMode::Output));
    }

    #[test]
    fn failed_mode_change_closes_the_pin() {
        let (sim, chip) = chip();
        let mut pins = PinRegistry::default();
        open(&mut pins, &chip, Pin::GPIO05, PinMode::Input).unwrap();

        sim.fail_requests(1);
        assert!(open(&mut pins, &chip, Pin::GPIO05, PinMode::Output).is_err());
        assert!(!pins.is_claimed(Pin::GPIO05));
        assert!(sim.requested().is_empty());
    }

    #[test]
    fn busy_lines_name_their_holder() {
        let (sim, chip) = chip();
        let mut pins = PinRegistry::default();
        sim.reserve(7, "other");
        match open(&mut pins, &chip, Pin::GPIO07, PinMode::Input) {
            Err(Error::LineBusy { pin, consumer }) => {
                assert_eq!(pin, Pin::GPIO07);
                assert_eq!(consumer, "other");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(!pins.is_claimed(Pin::GPIO07));
    }

    #[test]
    fn unknown_mode_and_out_of_range_pins_are_rejected() {
        let (_sim, chip) = chip();
        let mut pins = PinRegistry::default();
        assert!(matches!(
            open(&mut pins, &chip, Pin::GPIO04, PinMode::Unknown),
            Err(Error::InvalidMode { .. })
        ));
        assert!(matches!(
            open(&mut pins, &chip, Pin::new(16), PinMode::Input),
            Err(Error::PinOutOfRange { lines: 16, .. })
        ));
        assert_eq!(pins.len(), 0);
    }

    #[test]
    fn pull_failure_leaves_nothing_requested() {
        let (sim, chip) = chip();
        let mut pins = PinRegistry::default();
        let err = pins
            .open(hw(&chip), Pin::GPIO04, PinMode::Input, PullMode::PullUp, 0)
            .unwrap_err();
        assert!(matches!(err, Error::PullUnsupported));
        assert!(!pins.is_claimed(Pin::GPIO04));
        assert_eq!(sim.stats().line_requests, 0);
    }

    #[test]
    fn writes_need_output_mode() {
        let (sim, chip) = chip();
        let mut pins = PinRegistry::default();
        open(&mut pins, &chip, Pin::GPIO03, PinMode::Output).unwrap();
        pins.write(Pin::GPIO03, true).unwrap();
        assert_eq!(sim.level(3), 1);
        assert!(matches!(
            pins.read(Pin::GPIO03),
            Err(Error::Inconsistent(_))
        ));
    }

    #[test]
    fn close_releases_the_line() {
        let (sim, chip) = chip();
        let mut pins = PinRegistry::default();
        open(&mut pins, &chip, Pin::GPIO02, PinMode::EdgeDetection).unwrap();
        assert!(pins.edge_line(Pin::GPIO02).is_some());
        pins.close(Pin::GPIO02).unwrap();
        pins.close(Pin::GPIO02).unwrap();
        assert!(sim.requested().is_empty());
    }
}
