//! Process-wide table of open chips, shared by every pin manager.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, OnceLock},
};

use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::{
    backend::{ChipProvider, GpioChip},
    cdev::CdevProvider,
    Result,
};

static GLOBAL: OnceLock<Arc<ChipRegistry>> = OnceLock::new();

struct SharedChip {
    chip: Arc<dyn GpioChip>,
    refs: usize,
}

/// Reference-counted chip handles keyed by chip name.
///
/// The first [`attach`](Self::attach) of a name opens the chip through the
/// provider, later ones only bump the count. The entry is dropped on the last
/// [`detach`](Self::detach); the kernel descriptor closes once every clone of
/// the chip handle is gone as well.
pub struct ChipRegistry {
    provider: Box<dyn ChipProvider>,
    chips: Mutex<HashMap<String, SharedChip>>,
}

impl fmt::Debug for ChipRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChipRegistry")
            .field("provider", &self.provider)
            .field("open_chips", &self.open_chips())
            .finish()
    }
}

impl ChipRegistry {
    pub fn new<P>(provider: P) -> Self
    where
        P: ChipProvider + 'static,
    {
        Self {
            provider: Box::new(provider),
            chips: Mutex::new(HashMap::new()),
        }
    }

    /// The registry used by managers built without an explicit one, backed
    /// by the character devices under `/dev`.
    pub fn global() -> Arc<ChipRegistry> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(ChipRegistry::new(CdevProvider::default()))))
    }

    pub fn attach(&self, name: &str) -> Result<Arc<dyn GpioChip>> {
        let mut chips = self.chips.lock();
        if let Some(shared) = chips.get_mut(name) {
            shared.refs += 1;
            debug!(chip = name, refs = shared.refs, "Attached to open chip");
            return Ok(Arc::clone(&shared.chip));
        }

        // Held across the open: one name never maps to two chips.
        let chip = self.provider.open(name)?;
        info!(chip = name, lines = chip.num_lines(), "Opened chip");
        chips.insert(
            name.to_owned(),
            SharedChip {
                chip: Arc::clone(&chip),
                refs: 1,
            },
        );
        Ok(chip)
    }

    pub fn detach(&self, name: &str) {
        let released = {
            let mut chips = self.chips.lock();
            let Some(shared) = chips.get_mut(name) else {
                error!(chip = name, "Detach from a chip that is not open");
                return;
            };
            shared.refs -= 1;
            debug!(chip = name, refs = shared.refs, "Detached from chip");
            if shared.refs == 0 {
                chips.remove(name)
            } else {
                None
            }
        };

        if let Some(shared) = released {
            info!(chip = name, "Releasing chip");
            drop(shared.chip);
        }
    }

    /// Number of attachments to `name`, zero when it is not open.
    pub fn ref_count(&self, name: &str) -> usize {
        self.chips.lock().get(name).map_or(0, |shared| shared.refs)
    }

    pub fn open_chips(&self) -> Vec<String> {
        let mut names: Vec<String> = self.chips.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sim::SimProvider, Error};

    #[test]
    fn second_attach_reuses_the_chip() {
        let provider = SimProvider::new();
        let sim = provider.add_chip("gpiochip0", 8);
        let registry = ChipRegistry::new(provider);

        let a = registry.attach("gpiochip0").unwrap();
        let b = registry.attach("gpiochip0").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(sim.stats().opens, 1);
        assert_eq!(registry.ref_count("gpiochip0"), 2);

        drop(a);
        registry.detach("gpiochip0");
        assert_eq!(sim.stats().closes, 0);

        drop(b);
        registry.detach("gpiochip0");
        assert_eq!(sim.stats().closes, 1);
        assert!(registry.open_chips().is_empty());
    }

    #[test]
    fn failed_open_leaves_no_entry() {
        let provider = SimProvider::new();
        let sim = provider.add_chip("gpiochip0", 8);
        sim.set_fail_open(true);
        let registry = ChipRegistry::new(provider);

        assert!(matches!(registry.attach("gpiochip0"), Err(Error::Open { .. })));
        assert_eq!(registry.ref_count("gpiochip0"), 0);
    }

    #[test]
    fn detach_of_unknown_chip_is_ignored() {
        let registry = ChipRegistry::new(SimProvider::new());
        registry.detach("gpiochip7");
        assert!(registry.open_chips().is_empty());
    }
}
