use std::os::fd::{AsRawFd, BorrowedFd};

use crate::{macros::const_assert, Result};

/// Size of the name and label arrays, including the trailing NUL.
pub const GPIO_MAX_NAME_SIZE: usize = 32;

pub(crate) mod ffi {
    use super::GPIO_MAX_NAME_SIZE;

    pub(crate) const GPIO_IOC_MAGIC: u8 = 0xB4;

    #[derive(Debug)]
    #[repr(transparent)]
    pub(crate) struct CString<const N: usize>(pub(crate) [libc::c_char; N]);

    impl<const N: usize> CString<N> {
        /// Copies `s` into a NUL terminated buffer, cutting it at `N - 1` bytes.
        pub(crate) fn truncated(s: &str) -> Self {
            let mut buf = [0 as libc::c_char; N];
            for (dst, src) in buf.iter_mut().zip(s.bytes().take(N.saturating_sub(1))) {
                *dst = src as libc::c_char;
            }
            Self(buf)
        }

        pub(crate) fn to_string_lossy(&self) -> String {
            let bytes: Vec<u8> = self
                .0
                .iter()
                .take_while(|&&c| c != 0)
                .map(|&c| c as u8)
                .collect();
            String::from_utf8_lossy(&bytes).into_owned()
        }
    }

    /// Information about a certain GPIO chip
    #[derive(Debug)]
    #[repr(C)]
    pub(crate) struct GpioChipInfo {
        pub(crate) name: CString<GPIO_MAX_NAME_SIZE>,
        pub(crate) label: CString<GPIO_MAX_NAME_SIZE>,
        /// number of GPIO lines on this chip
        pub(crate) lines: u32,
    }

    crate::macros::wrap_ioctl!(
        ioctl_read!(
            gpio_get_chipinfo_ioctl,
            crate::common::ffi::GPIO_IOC_MAGIC,
            0x01,
            crate::common::ffi::GpioChipInfo
        ),
        crate::error::IoctlKind::GetChipInfo
    );
}

const_assert!(std::mem::size_of::<ffi::GpioChipInfo>() == 68);

/// Represents the information of a GPIO chip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChipInfo {
    name: String,
    label: String,
    lines: u32,
}

impl ChipInfo {
    /// The kernel name of the GPIO chip, e.g. `gpiochip0`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The functional label of the GPIO chip, may be empty.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// The number of GPIO lines on the chip.
    pub fn lines(&self) -> u32 {
        self.lines
    }
}

/// Get the information of the GPIO chip behind `chip`.
pub fn get_chipinfo(chip: BorrowedFd<'_>) -> Result<ChipInfo> {
    let mut inner: ffi::GpioChipInfo = unsafe { std::mem::zeroed() };
    ffi::gpio_get_chipinfo_ioctl(chip.as_raw_fd(), &mut inner)?;
    Ok(ChipInfo {
        name: inner.name.to_string_lossy(),
        label: inner.label.to_string_lossy(),
        lines: inner.lines,
    })
}
