//! Bindings for the v1 ABI of the Linux GPIO character device
//! ([gpio.h](https://elixir.bootlin.com/linux/v6.9.2/source/include/uapi/linux/gpio.h)).
//!
//! Every ioctl is wrapped into a safe function taking a borrowed file
//! descriptor. Ownership of the descriptors handed out by the kernel is
//! transferred to the caller as [`OwnedFd`](std::os::fd::OwnedFd), so
//! releasing a line is dropping its descriptor.
#![allow(unsafe_code)]

mod common;
pub mod error;
mod macros;
pub mod v1;

pub use common::{get_chipinfo, ChipInfo, GPIO_MAX_NAME_SIZE};
pub use error::{Error, IoctlKind, Result};
