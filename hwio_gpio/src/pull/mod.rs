//! Bias configuration outside the line-request API.
//!
//! The v1 line API cannot set bias on every kernel the board runs, so pulls
//! are written straight into the SoC registers by a [`PullController`]
//! picked at startup with [`detect`].

mod bcm2711;

use std::{fmt::Debug, path::Path};

use tracing::{info, warn};

pub use bcm2711::{Bcm2711Pull, PullRegisters, MAX_PULL_PIN};

use crate::{Error, Pin, PullMode, Result};

pub trait PullController: Send + Debug {
    /// Apply `pull` to `pin`. [`PullMode::AsIs`] always succeeds without
    /// touching hardware.
    fn set_pull(&self, pin: Pin, pull: PullMode) -> Result<()>;

    /// Read back the bias currently configured for `pin`.
    fn pull(&self, pin: Pin) -> Result<PullMode>;
}

/// For SoCs without a known register layout.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPullControl;

impl PullController for NoPullControl {
    fn set_pull(&self, _pin: Pin, pull: PullMode) -> Result<()> {
        match pull {
            PullMode::AsIs => Ok(()),
            _ => Err(Error::PullUnsupported),
        }
    }

    fn pull(&self, _pin: Pin) -> Result<PullMode> {
        Err(Error::PullUnsupported)
    }
}

/// Pick the controller matching the SoC behind `device`.
pub fn detect(device: &Path) -> Box<dyn PullController> {
    match Bcm2711Pull::probe(device) {
        Ok(pull) => {
            info!(device = %device.display(), "Using BCM2711 pull registers");
            Box::new(pull)
        }
        Err(e) => {
            warn!(device = %device.display(), error = %e, "Pull configuration unavailable");
            Box::new(NoPullControl)
        }
    }
}

/// The 2-bit register code of `pull`, `None` for [`PullMode::AsIs`].
pub(crate) fn register_code(pull: PullMode) -> Option<u32> {
    match pull {
        PullMode::AsIs => None,
        PullMode::Disabled => Some(0),
        PullMode::PullUp => Some(1),
        PullMode::PullDown => Some(2),
    }
}

pub(crate) fn from_register_code(code: u32) -> Option<PullMode> {
    match code {
        0 => Some(PullMode::Disabled),
        1 => Some(PullMode::PullUp),
        2 => Some(PullMode::PullDown),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for pull in [PullMode::Disabled, PullMode::PullUp, PullMode::PullDown] {
            let code = register_code(pull).unwrap();
            assert_eq!(from_register_code(code), Some(pull));
        }
        assert_eq!(register_code(PullMode::AsIs), None);
        assert_eq!(from_register_code(3), None);
    }

    #[test]
    fn no_pull_control_only_accepts_as_is() {
        assert!(NoPullControl.set_pull(Pin::GPIO04, PullMode::AsIs).is_ok());
        assert!(matches!(
            NoPullControl.set_pull(Pin::GPIO04, PullMode::PullUp),
            Err(Error::PullUnsupported)
        ));
    }

    #[test]
    fn missing_device_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let pull = detect(&dir.path().join("gpiomem"));
        assert!(pull.set_pull(Pin::GPIO04, PullMode::PullDown).is_err());
    }
}
