//! In-memory chips for tests and for developing drivers off the board.
//!
//! Lines loop back: reading a line returns the last level written to it or
//! set through [`SimChipHandle::set_level`]. Edge lines are backed by real
//! pipes, so the edge monitor polls them exactly like kernel descriptors.
//!
//! # Examples
//! ```rust
//! # use hwio_gpio::{sim::SimProvider, backend::{ChipProvider, Direction}};
//! let provider = SimProvider::new();
//! let handle = provider.add_chip("gpiochip0", 32);
//! let chip = provider.open("gpiochip0").unwrap();
//! let lines = chip.request_lines(&[4], Direction::Output, &[1], "demo").unwrap();
//! assert_eq!(handle.level(4), 1);
//! # drop(lines);
//! ```

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    io,
    os::fd::{AsFd, BorrowedFd},
    path::PathBuf,
    sync::{Arc, Weak},
};

use nix::errno::Errno;
use parking_lot::Mutex;
use tinyvec::TinyVec;

use crate::{
    backend::{ChipProvider, Direction, EdgeLine, EdgeReading, GpioChip, LineHandle, LineInfo},
    sys::Pipe,
    EdgeKind, Error, Result,
};

/// Calls made against one simulated chip.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimStats {
    pub opens: usize,
    pub closes: usize,
    pub line_requests: usize,
    pub line_releases: usize,
    pub edge_requests: usize,
    pub edge_releases: usize,
    pub value_reads: usize,
    pub value_writes: usize,
}

#[derive(Debug, Default)]
struct ChipState {
    lines: u32,
    levels: Vec<u8>,
    outputs: BTreeSet<u32>,
    owners: BTreeMap<u32, String>,
    reserved: BTreeSet<u32>,
    edges: BTreeMap<u32, Weak<SimEdgeLine>>,
    writes: Vec<(u32, u8)>,
    stats: SimStats,
    clock_ns: u64,
    fail_open: bool,
    failing_requests: usize,
}

impl ChipState {
    fn check_free(&mut self, offsets: &[u32], kind: lib_uapi::IoctlKind) -> Result<()> {
        if self.failing_requests > 0 {
            self.failing_requests -= 1;
            return Err(lib_uapi::Error::Ioctl {
                kind,
                source: Errno::EIO,
            }
            .into());
        }
        for &offset in offsets {
            let errno = if offset >= self.lines {
                Errno::EINVAL
            } else if self.owners.contains_key(&offset) {
                Errno::EBUSY
            } else {
                continue;
            };
            return Err(lib_uapi::Error::Ioctl {
                kind,
                source: errno,
            }
            .into());
        }
        Ok(())
    }

    fn drive(&mut self, offset: u32, level: u8) {
        self.levels[offset as usize] = level;
        self.writes.push((offset, level));
    }

    fn release(&mut self, offset: u32) {
        self.owners.remove(&offset);
        self.outputs.remove(&offset);
    }
}

/// Provider of simulated chips. Clones share the same chips.
#[derive(Debug, Clone, Default)]
pub struct SimProvider {
    chips: Arc<Mutex<HashMap<String, Arc<Mutex<ChipState>>>>>,
}

impl SimProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a chip with `lines` lines, all low and unused.
    pub fn add_chip(&self, name: &str, lines: u32) -> SimChipHandle {
        let state = Arc::new(Mutex::new(ChipState {
            lines,
            levels: vec![0; lines as usize],
            ..ChipState::default()
        }));
        self.chips.lock().insert(name.to_owned(), Arc::clone(&state));
        SimChipHandle { state }
    }
}

impl ChipProvider for SimProvider {
    fn open(&self, name: &str) -> Result<Arc<dyn GpioChip>> {
        let path = PathBuf::from("/sim").join(name);
        let state = match self.chips.lock().get(name) {
            Some(state) => Arc::clone(state),
            None => {
                return Err(Error::Open {
                    path,
                    source: io::ErrorKind::NotFound.into(),
                })
            }
        };

        let mut guard = state.lock();
        if guard.fail_open {
            return Err(Error::Open {
                path,
                source: io::ErrorKind::PermissionDenied.into(),
            });
        }
        guard.stats.opens += 1;
        let lines = guard.lines;
        drop(guard);

        Ok(Arc::new(SimChip {
            name: name.to_owned(),
            lines,
            state,
        }))
    }
}

/// Test-side view of a simulated chip.
#[derive(Debug, Clone)]
pub struct SimChipHandle {
    state: Arc<Mutex<ChipState>>,
}

impl SimChipHandle {
    pub fn stats(&self) -> SimStats {
        self.state.lock().stats
    }

    /// Every level driven so far, in order, as `(offset, level)`.
    pub fn writes(&self) -> Vec<(u32, u8)> {
        self.state.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    pub fn level(&self, offset: u32) -> u8 {
        self.state.lock().levels[offset as usize]
    }

    /// Drive a line from outside, as an external circuit would.
    pub fn set_level(&self, offset: u32, level: u8) {
        self.state.lock().levels[offset as usize] = level;
    }

    /// Claim a line for another consumer, so requests for it fail with `EBUSY`.
    pub fn reserve(&self, offset: u32, consumer: &str) {
        let mut state = self.state.lock();
        state.reserved.insert(offset);
        state.owners.insert(offset, consumer.to_owned());
    }

    pub fn unreserve(&self, offset: u32) {
        let mut state = self.state.lock();
        if state.reserved.remove(&offset) {
            state.owners.remove(&offset);
        }
    }

    pub fn is_requested(&self, offset: u32) -> bool {
        let state = self.state.lock();
        state.owners.contains_key(&offset) && !state.reserved.contains(&offset)
    }

    /// Offsets currently held through this chip.
    pub fn requested(&self) -> Vec<u32> {
        let state = self.state.lock();
        state
            .owners
            .keys()
            .filter(|offset| !state.reserved.contains(offset))
            .copied()
            .collect()
    }

    /// Make the next open of this chip fail with `PermissionDenied`.
    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Make the next `count` line or edge requests fail with `EIO`.
    pub fn fail_requests(&self, count: usize) {
        self.state.lock().failing_requests = count;
    }

    /// Queue an edge on a line in edge-detection mode.
    ///
    /// Returns `false` when nobody watches `offset`.
    pub fn inject_edge(&self, offset: u32, kind: EdgeKind) -> bool {
        let (line, reading) = {
            let mut state = self.state.lock();
            let Some(line) = state.edges.get(&offset).and_then(Weak::upgrade) else {
                return false;
            };
            state.clock_ns += 1_000;
            let current = state.levels[offset as usize];
            state.levels[offset as usize] = match kind {
                EdgeKind::Rising => 1,
                EdgeKind::Falling => 0,
                EdgeKind::Unknown => current,
            };
            let reading = EdgeReading {
                timestamp_ns: state.clock_ns,
                kind,
            };
            (line, reading)
        };
        // The upgraded line may be the last reference; drop it unlocked.
        line.push(reading).is_ok()
    }
}

#[derive(Debug)]
struct SimChip {
    name: String,
    lines: u32,
    state: Arc<Mutex<ChipState>>,
}

impl Drop for SimChip {
    fn drop(&mut self) {
        self.state.lock().stats.closes += 1;
    }
}

impl GpioChip for SimChip {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_lines(&self) -> u32 {
        self.lines
    }

    fn line_info(&self, offset: u32) -> Result<LineInfo> {
        let state = self.state.lock();
        if offset >= state.lines {
            return Err(lib_uapi::Error::Ioctl {
                kind: lib_uapi::IoctlKind::GetLineInfo,
                source: Errno::EINVAL,
            }
            .into());
        }
        let consumer = state.owners.get(&offset).cloned().unwrap_or_default();
        Ok(LineInfo {
            offset,
            name: format!("SIM{offset}"),
            used: !consumer.is_empty(),
            consumer,
            output: state.outputs.contains(&offset),
        })
    }

    fn request_lines(
        &self,
        offsets: &[u32],
        direction: Direction,
        defaults: &[u8],
        consumer: &str,
    ) -> Result<Box<dyn LineHandle>> {
        if offsets.is_empty() || (!defaults.is_empty() && defaults.len() != offsets.len()) {
            return Err(lib_uapi::Error::InvalidLineCount {
                count: offsets.len(),
                max: lib_uapi::v1::GPIOHANDLES_MAX,
            }
            .into());
        }

        let mut state = self.state.lock();
        state.check_free(offsets, lib_uapi::IoctlKind::GetLine)?;
        for (i, &offset) in offsets.iter().enumerate() {
            state.owners.insert(offset, consumer.to_owned());
            match direction {
                Direction::Output => {
                    state.outputs.insert(offset);
                    state.drive(offset, defaults.get(i).copied().unwrap_or(0));
                }
                Direction::Input => {
                    state.outputs.remove(&offset);
                }
                Direction::AsIs => {}
            }
        }
        state.stats.line_requests += 1;

        Ok(Box::new(SimLines {
            offsets: offsets.iter().copied().collect(),
            direction,
            state: Arc::clone(&self.state),
        }))
    }

    fn request_edge_events(&self, offset: u32, consumer: &str) -> Result<Arc<dyn EdgeLine>> {
        let mut state = self.state.lock();
        state.check_free(&[offset], lib_uapi::IoctlKind::GetLineEvent)?;
        let line = Arc::new(SimEdgeLine {
            offset,
            pipe: Pipe::new()?,
            pending: Mutex::new(VecDeque::new()),
            state: Arc::clone(&self.state),
        });
        state.owners.insert(offset, consumer.to_owned());
        state.outputs.remove(&offset);
        state.edges.insert(offset, Arc::downgrade(&line));
        state.stats.edge_requests += 1;
        Ok(line)
    }
}

#[derive(Debug)]
struct SimLines {
    offsets: TinyVec<[u32; 8]>,
    direction: Direction,
    state: Arc<Mutex<ChipState>>,
}

impl SimLines {
    fn check_count(&self, count: usize) -> Result<()> {
        if count != self.offsets.len() {
            return Err(Error::ValueCount {
                expected: self.offsets.len(),
                actual: count,
            });
        }
        Ok(())
    }
}

impl Drop for SimLines {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        for &offset in self.offsets.iter() {
            state.release(offset);
        }
        state.stats.line_releases += 1;
    }
}

impl LineHandle for SimLines {
    fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    fn get_values(&self, values: &mut [u8]) -> Result<()> {
        self.check_count(values.len())?;
        let mut state = self.state.lock();
        for (value, &offset) in values.iter_mut().zip(self.offsets.iter()) {
            *value = state.levels[offset as usize];
        }
        state.stats.value_reads += 1;
        Ok(())
    }

    fn set_values(&self, values: &[u8]) -> Result<()> {
        self.check_count(values.len())?;
        if self.direction != Direction::Output {
            return Err(lib_uapi::Error::Ioctl {
                kind: lib_uapi::IoctlKind::SetValues,
                source: Errno::EPERM,
            }
            .into());
        }
        let mut state = self.state.lock();
        for (&value, &offset) in values.iter().zip(self.offsets.iter()) {
            state.drive(offset, u8::from(value != 0));
        }
        state.stats.value_writes += 1;
        Ok(())
    }
}

#[derive(Debug)]
struct SimEdgeLine {
    offset: u32,
    pipe: Pipe,
    pending: Mutex<VecDeque<EdgeReading>>,
    state: Arc<Mutex<ChipState>>,
}

impl SimEdgeLine {
    fn push(&self, reading: EdgeReading) -> io::Result<()> {
        self.pending.lock().push_back(reading);
        self.pipe.write_byte(1)
    }
}

impl Drop for SimEdgeLine {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.release(self.offset);
        state.edges.remove(&self.offset);
        state.stats.edge_releases += 1;
    }
}

impl AsFd for SimEdgeLine {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.pipe.reader()
    }
}

impl EdgeLine for SimEdgeLine {
    fn offset(&self) -> u32 {
        self.offset
    }

    fn read_event(&self) -> Result<EdgeReading> {
        if self.pipe.read_byte()?.is_none() {
            return Err(Error::Io(io::ErrorKind::WouldBlock.into()));
        }
        self.pending
            .lock()
            .pop_front()
            .ok_or_else(|| crate::error::inconsistent("simulated edge without a queued event"))
    }
}
