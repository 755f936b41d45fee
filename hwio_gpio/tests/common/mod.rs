#![allow(dead_code)]

use std::{
    sync::{Arc, Once},
    time::{Duration, Instant},
};

use hwio_gpio::{
    pull::{NoPullControl, PullController},
    sim::{SimChipHandle, SimProvider},
    ChipRegistry, GpioPinManager, ManagerConfig,
};
use tracing_subscriber::EnvFilter;

pub const CHIP: &str = "gpiochip0";
pub const EDGE_TIMEOUT: Duration = Duration::from_millis(200);

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A simulated board with one 32-line chip and its own registry.
pub struct Bench {
    pub sim: SimChipHandle,
    pub registry: Arc<ChipRegistry>,
}

impl Bench {
    pub fn new() -> Self {
        init_tracing();
        let provider = SimProvider::new();
        let sim = provider.add_chip(CHIP, 32);
        Self {
            sim,
            registry: Arc::new(ChipRegistry::new(provider)),
        }
    }

    pub fn config() -> ManagerConfig {
        ManagerConfig::default()
            .with_consumer("test")
            .with_edge_timeout(EDGE_TIMEOUT)
    }

    pub fn manager_with_pull(&self, pulls: Box<dyn PullController>) -> GpioPinManager {
        GpioPinManager::with_parts(Self::config(), Arc::clone(&self.registry), pulls).unwrap()
    }

    pub fn manager_with_config(&self, config: ManagerConfig) -> GpioPinManager {
        GpioPinManager::with_parts(config, Arc::clone(&self.registry), Box::new(NoPullControl))
            .unwrap()
    }

    pub fn manager(&self) -> GpioPinManager {
        self.manager_with_pull(Box::new(NoPullControl))
    }

    pub fn open_manager(&self) -> GpioPinManager {
        let mut gpio = self.manager();
        gpio.open_chip(CHIP).unwrap();
        gpio
    }
}

/// Poll `done` until it holds or `limit` passes.
pub fn eventually(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}
