#![allow(unsafe_code)]

use std::{
    fmt,
    fs::{File, OpenOptions},
    io,
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
    path::{Path, PathBuf},
    ptr::NonNull,
};

use tracing::trace;

use super::{from_register_code, register_code, PullController};
use crate::{error::inconsistent, Error, Pin, PullMode, Result};

const BLOCK_SIZE: usize = 4096;
const REGISTER_COUNT: usize = BLOCK_SIZE / std::mem::size_of::<u32>();
/// GPIO_PUP_PDN_CNTRL_REG0, in 32-bit words from the block start.
const GPPUPPDN0: usize = 57;
const PULL_REGISTERS: usize = 4;
/// Word that reads `"gpio"` on SoCs predating the BCM2711 pull registers.
const SIGNATURE_REG: usize = 60;
const LEGACY_SIGNATURE: u32 = 0x6770_696f;

/// Highest pin with a pull field.
pub const MAX_PULL_PIN: u32 = 57;

/// Register index and bit shift of the 2-bit field of `pin`.
fn pull_field(pin: u32) -> (usize, u32) {
    (GPPUPPDN0 + (pin >> 4) as usize, (pin & 0xF) * 2)
}

fn apply_pull(word: u32, shift: u32, code: u32) -> u32 {
    (word & !(0b11 << shift)) | (code << shift)
}

/// One page of GPIO registers mapped from the special file.
struct MappedRegisters {
    base: NonNull<u32>,
    _file: File,
}

impl MappedRegisters {
    fn map(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC | libc::O_CLOEXEC)
            .open(path)
            .map_err(|source| Error::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                BLOCK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        let base = NonNull::new(ptr.cast::<u32>())
            .ok_or_else(|| Error::Io(io::ErrorKind::AddrNotAvailable.into()))?;

        Ok(Self { base, _file: file })
    }

    fn read(&self, reg: usize) -> u32 {
        debug_assert!(reg < REGISTER_COUNT);
        // SAFETY: `reg` lies inside the mapped page.
        unsafe { self.base.as_ptr().add(reg).read_volatile() }
    }

    fn write(&self, reg: usize, value: u32) {
        debug_assert!(reg < REGISTER_COUNT);
        // SAFETY: `reg` lies inside the mapped page.
        unsafe { self.base.as_ptr().add(reg).write_volatile(value) }
    }

    fn check_signature(&self) -> Result<()> {
        if self.read(SIGNATURE_REG) == LEGACY_SIGNATURE {
            return Err(Error::PullUnsupported);
        }
        Ok(())
    }
}

impl Drop for MappedRegisters {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr().cast(), BLOCK_SIZE);
        }
    }
}

/// Pull control through the BCM2711 `GPIO_PUP_PDN_CNTRL` registers.
///
/// The page is mapped for each call and unmapped right after, so nothing is
/// held between operations.
#[derive(Debug, Clone)]
pub struct Bcm2711Pull {
    device: PathBuf,
}

impl Bcm2711Pull {
    /// Map `device` once and check the SoC signature.
    pub fn probe<P>(device: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        MappedRegisters::map(device.as_ref())?.check_signature()?;
        Ok(Self {
            device: device.as_ref().to_path_buf(),
        })
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    fn map(&self) -> Result<MappedRegisters> {
        let regs = MappedRegisters::map(&self.device)?;
        regs.check_signature()?;
        Ok(regs)
    }

    /// Snapshot of the four pull registers.
    pub fn dump(&self) -> Result<PullRegisters> {
        let regs = self.map()?;
        let mut words = [0u32; PULL_REGISTERS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = regs.read(GPPUPPDN0 + i);
        }
        Ok(PullRegisters(words))
    }
}

impl PullController for Bcm2711Pull {
    fn set_pull(&self, pin: Pin, pull: PullMode) -> Result<()> {
        let Some(code) = register_code(pull) else {
            return Ok(());
        };
        if pin.offset() > MAX_PULL_PIN {
            return Err(Error::PullPinOutOfRange(pin));
        }

        let regs = self.map()?;
        let (reg, shift) = pull_field(pin.offset());
        let old = regs.read(reg);
        let new = apply_pull(old, shift, code);
        regs.write(reg, new);
        trace!(%pin, ?pull, reg, old, new, "Pull register written");
        Ok(())
    }

    fn pull(&self, pin: Pin) -> Result<PullMode> {
        if pin.offset() > MAX_PULL_PIN {
            return Err(Error::PullPinOutOfRange(pin));
        }
        let regs = self.map()?;
        let (reg, shift) = pull_field(pin.offset());
        from_register_code((regs.read(reg) >> shift) & 0b11)
            .ok_or_else(|| inconsistent("reserved pull code in register"))
    }
}

/// The `GPIO_PUP_PDN_CNTRL_REG0..3` words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullRegisters([u32; PULL_REGISTERS]);

impl PullRegisters {
    pub fn words(&self) -> &[u32; PULL_REGISTERS] {
        &self.0
    }

    /// The configured bias of `pin`, `None` when out of range or reserved.
    pub fn field(&self, pin: Pin) -> Option<PullMode> {
        if pin.offset() > MAX_PULL_PIN {
            return None;
        }
        let (reg, shift) = pull_field(pin.offset());
        from_register_code((self.0[reg - GPPUPPDN0] >> shift) & 0b11)
    }
}

impl fmt::Display for PullRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, word) in self.0.iter().enumerate() {
            writeln!(f, "GPIO_PUP_PDN_CNTRL_REG{i}: {word:#010x}")?;
        }
        for offset in 0..=MAX_PULL_PIN {
            let pin = Pin::new(offset);
            let name = match self.field(pin) {
                Some(PullMode::Disabled) => "none",
                Some(PullMode::PullUp) => "up",
                Some(PullMode::PullDown) => "down",
                Some(PullMode::AsIs) | None => "reserved",
            };
            write!(f, "{pin}={name}")?;
            f.write_str(if offset % 8 == 7 || offset == MAX_PULL_PIN { "\n" } else { " " })?;
        }
        Ok(())
    }
}
