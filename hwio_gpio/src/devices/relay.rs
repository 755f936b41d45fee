use tracing::{debug, error};

use crate::{Error, GpioPinManager, Pin, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayNormalState {
    NormallyOpen,
    NormallyClosed,
}

impl RelayNormalState {
    /// Coil level that powers the load.
    fn level(self, on: bool) -> bool {
        match self {
            Self::NormallyOpen => on,
            Self::NormallyClosed => !on,
        }
    }
}

/// A bank of relays, each driven by one pin.
///
/// "On" means the switched circuit is closed: a normally-open relay is
/// energized, a normally-closed one released.
#[derive(Debug)]
pub struct Relay {
    gpio: GpioPinManager,
    relays: Vec<(Pin, RelayNormalState)>,
}

impl Relay {
    /// Take over `gpio`, which must have a chip open, and switch every relay
    /// to `initially_on`. At least one relay is required.
    pub fn new(
        mut gpio: GpioPinManager,
        relays: &[(Pin, RelayNormalState)],
        initially_on: bool,
    ) -> Result<Self> {
        if !gpio.is_open() {
            return Err(Error::ChipNotOpen);
        }
        if relays.is_empty() {
            return Err(Error::EmptyGroup);
        }
        for (i, &(pin, normal)) in relays.iter().enumerate() {
            if relays[..i].iter().any(|&(other, _)| other == pin) {
                return Err(Error::DuplicatePin(pin));
            }
            if let Err(e) = gpio.set_pin_value(pin, normal.level(initially_on)) {
                error!(relay = i, %pin, error = %e, "Failed to initialize relay");
                gpio.close();
                return Err(e);
            }
        }
        debug!(count = relays.len(), initially_on, "Relay bank ready");
        Ok(Self {
            gpio,
            relays: relays.to_vec(),
        })
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn set(&mut self, index: usize, on: bool) -> Result<()> {
        let &(pin, normal) = self
            .relays
            .get(index)
            .ok_or(Error::InvalidChannel(index))?;
        self.gpio.set_pin_value(pin, normal.level(on))
    }

    pub fn turn_on(&mut self, index: usize) -> Result<()> {
        self.set(index, true)
    }

    pub fn turn_off(&mut self, index: usize) -> Result<()> {
        self.set(index, false)
    }

    pub fn gpio(&self) -> &GpioPinManager {
        &self.gpio
    }

    pub fn into_inner(self) -> GpioPinManager {
        self.gpio
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_state_decides_the_coil_level() {
        assert!(RelayNormalState::NormallyOpen.level(true));
        assert!(!RelayNormalState::NormallyOpen.level(false));
        assert!(!RelayNormalState::NormallyClosed.level(true));
        assert!(RelayNormalState::NormallyClosed.level(false));
    }
}
