//! The seam between the pin bookkeeping and whatever provides GPIO lines.
//!
//! [`cdev`](crate::cdev) implements it on the kernel character device,
//! [`sim`](crate::sim) in memory. Every native resource is released by
//! dropping its handle.

use std::{fmt::Debug, os::fd::AsFd, sync::Arc};

use crate::{EdgeKind, Result};

/// Direction requested for a set of lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    AsIs,
    Input,
    Output,
}

/// What the chip reports about one line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    pub offset: u32,
    /// Name given by the driver or device tree, may be empty.
    pub name: String,
    /// Label of the current holder, empty when unused.
    pub consumer: String,
    pub used: bool,
    pub output: bool,
}

/// One edge event as read from an [`EdgeLine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeReading {
    /// Monotonic timestamp of the transition, in nanoseconds.
    pub timestamp_ns: u64,
    pub kind: EdgeKind,
}

pub trait ChipProvider: Send + Sync + Debug {
    /// Open the chip called `name`, e.g. `gpiochip0`.
    fn open(&self, name: &str) -> Result<Arc<dyn GpioChip>>;
}

pub trait GpioChip: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn num_lines(&self) -> u32;

    fn line_info(&self, offset: u32) -> Result<LineInfo>;

    /// Request `offsets` as one handle.
    ///
    /// `defaults` is either empty or holds one initial level per offset; it is
    /// only applied for [`Direction::Output`].
    fn request_lines(
        &self,
        offsets: &[u32],
        direction: Direction,
        defaults: &[u8],
        consumer: &str,
    ) -> Result<Box<dyn LineHandle>>;

    /// Request rising and falling edge events for the line at `offset`.
    fn request_edge_events(&self, offset: u32, consumer: &str) -> Result<Arc<dyn EdgeLine>>;
}

pub trait LineHandle: Send + Debug {
    fn offsets(&self) -> &[u32];

    /// Read every line of the handle, `values` has one slot per offset.
    fn get_values(&self, values: &mut [u8]) -> Result<()>;

    /// Drive every line of the handle in a single call.
    fn set_values(&self, values: &[u8]) -> Result<()>;
}

/// A line in edge-detection mode. The descriptor becomes readable when an
/// event is pending.
pub trait EdgeLine: AsFd + Send + Sync + Debug {
    fn offset(&self) -> u32;

    /// Read one pending event. Only call after `poll(2)` reported the
    /// descriptor readable.
    fn read_event(&self) -> Result<EdgeReading>;
}
