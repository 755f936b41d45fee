//! GPIO line and resource management for single-board computers.
//!
//! A [`GpioPinManager`] claims pins on one chip for one device driver.
//! Managers share chip handles through a [`ChipRegistry`], group pins for
//! atomic bulk access, and report edges from a background monitor thread
//! that the owning thread dispatches with
//! [`GpioPinManager::dispatch_edge_events`].
//!
//! # Notes
//! - Pins are requested through the v1 character-device ABI. Bias is set
//!   through the SoC registers where a [`pull::PullController`] exists for
//!   the board.
//! - Pins of a group are only driven through the group.

pub mod backend;
pub mod cdev;
mod config;
pub mod devices;
mod error;
mod group;
mod manager;
mod monitor;
mod pin;
mod pins;
pub mod pull;
mod registry;
pub mod sim;
mod sys;

pub use config::{ManagerConfig, DEFAULT_CONSUMER, DEFAULT_EDGE_TIMEOUT, DEFAULT_PULL_DEVICE};
pub use error::{Error, Result};
pub use group::{GroupId, MAX_GROUP_PINS};
pub use manager::{EdgeCallback, GpioPinManager};
pub use monitor::EdgeEvent;
pub use pin::{BoardChip, EdgeKind, Pin, PinMode, PullMode};
pub use registry::ChipRegistry;
