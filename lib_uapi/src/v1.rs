//! GPIO v1 ABI: line handles for plain value access and line events for
//! edge detection.
//!
//! Line handles cover 1 to [`GPIOHANDLES_MAX`] offsets of one chip and are
//! read or written with a single ioctl, which is what makes bulk access
//! atomic across the requested lines.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use bitflags::bitflags;

use crate::{
    common::ffi::CString,
    error::{ioctl_error, Error, IoctlKind},
    macros::const_assert,
    Result,
};

/// Maximum number of lines in one handle request.
pub const GPIOHANDLES_MAX: usize = 64;

bitflags! {
    /// Gpio Line Info Flags returned by the kernel.
    ///
    /// Mapping of the flags can be found in the kernel source code:
    /// [gpio.h](https://elixir.bootlin.com/linux/v6.9.2/source/include/uapi/linux/gpio.h#L313)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LineFlags: u32 {
        const KERNEL         = 1 << 0;
        const IS_OUT         = 1 << 1;
        const ACTIVE_LOW     = 1 << 2;
        const OPEN_DRAIN     = 1 << 3;
        const OPEN_SOURCE    = 1 << 4;
        const BIAS_PULL_UP   = 1 << 5;
        const BIAS_PULL_DOWN = 1 << 6;
        const BIAS_DISABLE   = 1 << 7;
    }
}

bitflags! {
    /// Line Request Flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleFlags: u32 {
        const INPUT          = 1 << 0;
        const OUTPUT         = 1 << 1;
        const ACTIVE_LOW     = 1 << 2;
        const OPEN_DRAIN     = 1 << 3;
        const OPEN_SOURCE    = 1 << 4;
        const BIAS_PULL_UP   = 1 << 5;
        const BIAS_PULL_DOWN = 1 << 6;
        const BIAS_DISABLE   = 1 << 7;
    }
}

bitflags! {
    /// Event Request flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventFlags: u32 {
        const RISING_EDGE  = 1 << 0;
        const FALLING_EDGE = 1 << 1;
        const BOTH_EDGES   = Self::RISING_EDGE.bits() | Self::FALLING_EDGE.bits();
    }
}

mod ffi {
    use crate::common::ffi::CString;
    use crate::GPIO_MAX_NAME_SIZE;

    use super::GPIOHANDLES_MAX;

    /// Infomation about a certain GPIO line.
    #[repr(C)]
    #[derive(Debug)]
    pub(crate) struct GpioLineInfo {
        /// the local offset on this GPIO device, fill this in
        /// when requesting the line infomation from the kernel.
        pub(crate) line_offset: u32,
        pub(crate) flags: u32,
        pub(crate) name: CString<GPIO_MAX_NAME_SIZE>,
        /// a functional name for the consumer of this GPIO line
        /// as set by whatever is using it.
        pub(crate) consumer: CString<GPIO_MAX_NAME_SIZE>,
    }

    /// Information about a GPIO handle request.
    #[repr(C)]
    #[derive(Debug)]
    pub(crate) struct GpioHandleRequest {
        pub(crate) lineoffsets: [u32; GPIOHANDLES_MAX],
        pub(crate) flags: u32,
        /// default output value per line when `OUTPUT` is requested.
        pub(crate) default_values: [u8; GPIOHANDLES_MAX],
        pub(crate) consumer_label: CString<GPIO_MAX_NAME_SIZE>,
        pub(crate) lines: u32,
        /// after a successful request, this is the file
        /// descriptor for the requested GPIO handle.
        pub(crate) fd: libc::c_int,
    }

    #[repr(C)]
    #[derive(Debug)]
    pub(crate) struct GpioHandleData {
        pub(crate) values: [u8; GPIOHANDLES_MAX],
    }

    /// Information about a GPIO event request.
    #[repr(C)]
    #[derive(Debug)]
    pub(crate) struct GpioEventRequest {
        pub(crate) lineoffset: u32,
        pub(crate) handleflags: u32,
        pub(crate) eventflags: u32,
        pub(crate) consumer_label: CString<GPIO_MAX_NAME_SIZE>,
        pub(crate) fd: libc::c_int,
    }

    /// The actual event being pushed to userspace
    #[repr(C)]
    #[derive(Debug)]
    pub(crate) struct GpioEventData {
        pub(crate) timestamp: u64,
        /// event identifier, `0x01` rising, `0x02` falling
        pub(crate) id: u32,
    }

    crate::macros::wrap_ioctl!(
        ioctl_readwrite!(
            gpio_get_lineinfo_ioctl,
            crate::common::ffi::GPIO_IOC_MAGIC,
            0x02,
            crate::v1::ffi::GpioLineInfo
        ),
        crate::error::IoctlKind::GetLineInfo
    );

    crate::macros::wrap_ioctl!(
        ioctl_readwrite!(
            gpio_get_linehandle_ioctl,
            crate::common::ffi::GPIO_IOC_MAGIC,
            0x03,
            crate::v1::ffi::GpioHandleRequest
        ),
        crate::error::IoctlKind::GetLine
    );

    crate::macros::wrap_ioctl!(
        ioctl_readwrite!(
            gpio_get_lineevent_ioctl,
            crate::common::ffi::GPIO_IOC_MAGIC,
            0x04,
            crate::v1::ffi::GpioEventRequest
        ),
        crate::error::IoctlKind::GetLineEvent
    );

    crate::macros::wrap_ioctl!(
        ioctl_readwrite!(
            gpiohandle_get_line_values_ioctl,
            crate::common::ffi::GPIO_IOC_MAGIC,
            0x08,
            crate::v1::ffi::GpioHandleData
        ),
        crate::error::IoctlKind::GetValues
    );

    crate::macros::wrap_ioctl!(
        ioctl_readwrite!(
            gpiohandle_set_line_values_ioctl,
            crate::common::ffi::GPIO_IOC_MAGIC,
            0x09,
            crate::v1::ffi::GpioHandleData
        ),
        crate::error::IoctlKind::SetValues
    );
}

const_assert!(std::mem::size_of::<ffi::GpioLineInfo>() == 72);
const_assert!(std::mem::size_of::<ffi::GpioHandleRequest>() == 364);
const_assert!(std::mem::size_of::<ffi::GpioHandleData>() == GPIOHANDLES_MAX);
const_assert!(std::mem::size_of::<ffi::GpioEventRequest>() == 48);
const_assert!(std::mem::size_of::<ffi::GpioEventData>() == 16);

/// Information about one line as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    offset: u32,
    flags: LineFlags,
    name: String,
    consumer: String,
}

impl LineInfo {
    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn flags(&self) -> LineFlags {
        self.flags
    }

    /// The line name given by the chip driver or device tree, may be empty.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The consumer label of whoever holds the line, empty when unused.
    pub fn consumer(&self) -> &str {
        &self.consumer
    }
}

/// Did the line rise or fall?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RisingEdge,
    FallingEdge,
    Unknown(u32),
}

impl From<u32> for EventKind {
    fn from(id: u32) -> Self {
        match id {
            0x01 => Self::RisingEdge,
            0x02 => Self::FallingEdge,
            other => Self::Unknown(other),
        }
    }
}

/// One edge event read from a line event descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Kernel timestamp of the transition, in nanoseconds.
    pub timestamp_ns: u64,
    pub kind: EventKind,
}

/// Get the information of the line at `offset`.
pub fn get_lineinfo(chip: BorrowedFd<'_>, offset: u32) -> Result<LineInfo> {
    let mut inner: ffi::GpioLineInfo = unsafe { std::mem::zeroed() };
    inner.line_offset = offset;
    ffi::gpio_get_lineinfo_ioctl(chip.as_raw_fd(), &mut inner)?;
    Ok(LineInfo {
        offset: inner.line_offset,
        flags: LineFlags::from_bits_retain(inner.flags),
        name: inner.name.to_string_lossy(),
        consumer: inner.consumer.to_string_lossy(),
    })
}

/// Request a handle for `offsets`, all configured with `flags`.
///
/// `defaults` holds the initial level of every line and is only used by the
/// kernel when [`HandleFlags::OUTPUT`] is set.
pub fn request_lines(
    chip: BorrowedFd<'_>,
    offsets: &[u32],
    flags: HandleFlags,
    defaults: &[u8],
    consumer: &str,
) -> Result<OwnedFd> {
    let count = offsets.len();
    if count == 0 || count > GPIOHANDLES_MAX || defaults.len() != count {
        return Err(Error::InvalidLineCount {
            count,
            max: GPIOHANDLES_MAX,
        });
    }

    let mut request: ffi::GpioHandleRequest = unsafe { std::mem::zeroed() };
    request.lineoffsets[..count].copy_from_slice(offsets);
    request.default_values[..count].copy_from_slice(defaults);
    request.flags = flags.bits();
    request.consumer_label = CString::truncated(consumer);
    request.lines = count as u32;

    ffi::gpio_get_linehandle_ioctl(chip.as_raw_fd(), &mut request)?;
    debug_assert!(request.fd > 0);
    Ok(unsafe { OwnedFd::from_raw_fd(request.fd) })
}

/// Request an event descriptor reporting `events` on the line at `offset`.
pub fn request_events(
    chip: BorrowedFd<'_>,
    offset: u32,
    handle_flags: HandleFlags,
    events: EventFlags,
    consumer: &str,
) -> Result<OwnedFd> {
    let mut request: ffi::GpioEventRequest = unsafe { std::mem::zeroed() };
    request.lineoffset = offset;
    request.handleflags = handle_flags.bits();
    request.eventflags = events.bits();
    request.consumer_label = CString::truncated(consumer);

    ffi::gpio_get_lineevent_ioctl(chip.as_raw_fd(), &mut request)?;
    debug_assert!(request.fd > 0);
    Ok(unsafe { OwnedFd::from_raw_fd(request.fd) })
}

/// Read the levels of every line of `handle` into `values`.
///
/// `values` must hold exactly as many entries as the handle has lines.
pub fn get_values(handle: BorrowedFd<'_>, values: &mut [u8]) -> Result<()> {
    if values.len() > GPIOHANDLES_MAX {
        return Err(Error::InvalidLineCount {
            count: values.len(),
            max: GPIOHANDLES_MAX,
        });
    }
    let mut data: ffi::GpioHandleData = unsafe { std::mem::zeroed() };
    ffi::gpiohandle_get_line_values_ioctl(handle.as_raw_fd(), &mut data)?;
    let count = values.len();
    values.copy_from_slice(&data.values[..count]);
    Ok(())
}

/// Drive every line of `handle` to the matching entry of `values`.
pub fn set_values(handle: BorrowedFd<'_>, values: &[u8]) -> Result<()> {
    let count = values.len();
    if count == 0 || count > GPIOHANDLES_MAX {
        return Err(Error::InvalidLineCount {
            count,
            max: GPIOHANDLES_MAX,
        });
    }
    let mut data: ffi::GpioHandleData = unsafe { std::mem::zeroed() };
    data.values[..count].copy_from_slice(values);
    ffi::gpiohandle_set_line_values_ioctl(handle.as_raw_fd(), &mut data)?;
    Ok(())
}

/// Read one pending event. Blocks unless the descriptor is non-blocking or
/// was reported readable by `poll(2)`.
pub fn read_event(events: BorrowedFd<'_>) -> Result<Event> {
    const EVENT_LEN: usize = std::mem::size_of::<ffi::GpioEventData>();
    let mut data: ffi::GpioEventData = unsafe { std::mem::zeroed() };
    let ptr = std::ptr::addr_of_mut!(data) as *mut libc::c_void;
    match unsafe { libc::read(events.as_raw_fd(), ptr, EVENT_LEN) } {
        -1 => Err(ioctl_error(IoctlKind::ReadEvent, nix::Error::last())),
        n if n.unsigned_abs() != EVENT_LEN => Err(Error::ShortRead {
            expected: EVENT_LEN,
            actual: n.unsigned_abs(),
        }),
        _ => Ok(Event {
            timestamp_ns: data.timestamp,
            kind: EventKind::from(data.id),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use super::*;

    #[test]
    fn event_ids_follow_kernel_numbering() {
        assert_eq!(EventKind::from(1), EventKind::RisingEdge);
        assert_eq!(EventKind::from(2), EventKind::FallingEdge);
        assert_eq!(EventKind::from(7), EventKind::Unknown(7));
    }

    #[test]
    fn empty_request_is_rejected_before_the_ioctl() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let err = request_lines(file.as_fd(), &[], HandleFlags::INPUT, &[], "test").unwrap_err();
        assert!(matches!(err, Error::InvalidLineCount { count: 0, .. }));
    }

    #[test]
    fn mismatched_defaults_are_rejected() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let err =
            request_lines(file.as_fd(), &[1, 2], HandleFlags::OUTPUT, &[0], "test").unwrap_err();
        assert!(matches!(err, Error::InvalidLineCount { count: 2, .. }));
    }

    #[test]
    fn chip_ioctls_fail_on_non_gpio_files() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let err = get_lineinfo(file.as_fd(), 0).unwrap_err();
        assert!(matches!(
            err,
            Error::Ioctl {
                kind: IoctlKind::GetLineInfo,
                ..
            }
        ));
    }

    #[test]
    fn short_reads_are_reported() {
        let file = std::fs::File::open("/dev/null").unwrap();
        let err = read_event(file.as_fd()).unwrap_err();
        assert!(matches!(err, Error::ShortRead { actual: 0, .. }));
    }
}
