//! Backend on the Linux GPIO character device (`/dev/gpiochipN`).
//!
//! # Examples
//! ```rust,no_run
//! # use hwio_gpio::{backend::ChipProvider, cdev::CdevProvider};
//! let chip = CdevProvider::default().open("gpiochip0").unwrap();
//! println!("{} has {} lines", chip.name(), chip.num_lines());
//! ```

use std::{
    fs::{File, OpenOptions},
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
    sync::Arc,
};

use lib_uapi::v1::{self, EventFlags, HandleFlags, LineFlags};
use tinyvec::TinyVec;
use tracing::debug;

use crate::{
    backend::{ChipProvider, Direction, EdgeLine, EdgeReading, GpioChip, LineHandle, LineInfo},
    EdgeKind, Error, Result,
};

pub const DEFAULT_DEV_DIR: &str = "/dev";

/// Opens chips as `<dir>/<name>`.
#[derive(Debug, Clone)]
pub struct CdevProvider {
    dev_dir: PathBuf,
}

impl Default for CdevProvider {
    fn default() -> Self {
        Self::new(DEFAULT_DEV_DIR)
    }
}

impl CdevProvider {
    pub fn new<P>(dev_dir: P) -> Self
    where
        P: AsRef<Path>,
    {
        Self {
            dev_dir: dev_dir.as_ref().to_path_buf(),
        }
    }

    pub fn dev_dir(&self) -> &Path {
        &self.dev_dir
    }
}

impl ChipProvider for CdevProvider {
    fn open(&self, name: &str) -> Result<Arc<dyn GpioChip>> {
        let path = self.dev_dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| Error::Open {
                path: path.clone(),
                source,
            })?;
        let info = lib_uapi::get_chipinfo(file.as_fd())?;
        debug!(
            chip = info.name(),
            label = info.label(),
            lines = info.lines(),
            "Opened {}",
            path.display()
        );
        Ok(Arc::new(CdevChip {
            file,
            name: name.to_owned(),
            lines: info.lines(),
        }))
    }
}

#[derive(Debug)]
struct CdevChip {
    file: File,
    name: String,
    lines: u32,
}

impl Drop for CdevChip {
    fn drop(&mut self) {
        debug!(chip = %self.name, "Closing chip");
    }
}

impl GpioChip for CdevChip {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_lines(&self) -> u32 {
        self.lines
    }

    fn line_info(&self, offset: u32) -> Result<LineInfo> {
        let info = v1::get_lineinfo(self.file.as_fd(), offset)?;
        Ok(LineInfo {
            offset: info.offset(),
            name: info.name().to_owned(),
            consumer: info.consumer().to_owned(),
            used: info.flags().contains(LineFlags::KERNEL),
            output: info.flags().contains(LineFlags::IS_OUT),
        })
    }

    fn request_lines(
        &self,
        offsets: &[u32],
        direction: Direction,
        defaults: &[u8],
        consumer: &str,
    ) -> Result<Box<dyn LineHandle>> {
        let flags = match direction {
            Direction::AsIs => HandleFlags::empty(),
            Direction::Input => HandleFlags::INPUT,
            Direction::Output => HandleFlags::OUTPUT,
        };
        let mut levels: TinyVec<[u8; 8]> = defaults.iter().copied().collect();
        if levels.is_empty() {
            levels.resize(offsets.len(), 0);
        }

        let fd = v1::request_lines(self.file.as_fd(), offsets, flags, &levels, consumer)?;
        Ok(Box::new(CdevLines {
            fd,
            offsets: offsets.iter().copied().collect(),
        }))
    }

    fn request_edge_events(&self, offset: u32, consumer: &str) -> Result<Arc<dyn EdgeLine>> {
        let fd = v1::request_events(
            self.file.as_fd(),
            offset,
            HandleFlags::INPUT,
            EventFlags::BOTH_EDGES,
            consumer,
        )?;
        Ok(Arc::new(CdevEdgeLine { fd, offset }))
    }
}

#[derive(Debug)]
struct CdevLines {
    fd: OwnedFd,
    offsets: TinyVec<[u32; 8]>,
}

impl CdevLines {
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

impl LineHandle for CdevLines {
    fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    fn get_values(&self, values: &mut [u8]) -> Result<()> {
        self.check_count(values.len())?;
        v1::get_values(self.fd.as_fd(), values)?;
        Ok(())
    }

    fn set_values(&self, values: &[u8]) -> Result<()> {
        self.check_count(values.len())?;
        v1::set_values(self.fd.as_fd(), values)?;
        Ok(())
    }
}

#[derive(Debug)]
struct CdevEdgeLine {
    fd: OwnedFd,
    offset: u32,
}

impl AsFd for CdevEdgeLine {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl EdgeLine for CdevEdgeLine {
    fn offset(&self) -> u32 {
        self.offset
    }

    fn read_event(&self) -> Result<EdgeReading> {
        let event = v1::read_event(self.fd.as_fd())?;
        Ok(EdgeReading {
            timestamp_ns: event.timestamp_ns,
            kind: EdgeKind::from(event.kind),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_chip_reports_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let provider = CdevProvider::new(dir.path());
        let err = provider.open("gpiochip9").unwrap_err();
        match err {
            Error::Open { path, .. } => assert_eq!(path, dir.path().join("gpiochip9")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn non_gpio_files_fail_the_chip_info_ioctl() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gpiochip0"), b"").unwrap();
        let err = CdevProvider::new(dir.path()).open("gpiochip0").unwrap_err();
        assert!(matches!(err, Error::Uapi(lib_uapi::Error::Ioctl { .. })));
    }
}
