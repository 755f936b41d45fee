#![allow(unsafe_code)]

use std::{
    io,
    os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd},
    time::Duration,
};

/// Non-blocking, close-on-exec pipe.
#[derive(Debug)]
pub(crate) struct Pipe {
    read: OwnedFd,
    write: OwnedFd,
}

impl Pipe {
    pub(crate) fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) } == -1 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 succeeded, both descriptors are fresh and owned by us.
        Ok(unsafe {
            Self {
                read: OwnedFd::from_raw_fd(fds[0]),
                write: OwnedFd::from_raw_fd(fds[1]),
            }
        })
    }

    pub(crate) fn reader(&self) -> BorrowedFd<'_> {
        self.read.as_fd()
    }

    /// Make the read end readable. A full pipe already is.
    pub(crate) fn notify(&self) -> io::Result<()> {
        match self.write_byte(1) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            other => other,
        }
    }

    pub(crate) fn write_byte(&self, byte: u8) -> io::Result<()> {
        let buf = [byte];
        let n = unsafe { libc::write(self.write.as_raw_fd(), buf.as_ptr().cast(), 1) };
        if n == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// `None` when nothing is pending.
    pub(crate) fn read_byte(&self) -> io::Result<Option<u8>> {
        let mut buf = [0u8; 1];
        let n = unsafe { libc::read(self.read.as_raw_fd(), buf.as_mut_ptr().cast(), 1) };
        match n {
            1 => Ok(Some(buf[0])),
            0 => Ok(None),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    pub(crate) fn drain(&self) {
        while let Ok(Some(_)) = self.read_byte() {}
    }
}

/// Wait until any of `fds` is readable or `timeout` expires.
///
/// Returns one flag per descriptor. An interrupted wait reports nothing ready.
pub(crate) fn poll_readable(fds: &[BorrowedFd<'_>], timeout: Duration) -> io::Result<Vec<bool>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|fd| libc::pollfd {
            fd: fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

    let n = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout_ms,
        )
    };
    if n == -1 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(vec![false; fds.len()]);
        }
        return Err(err);
    }

    Ok(pollfds
        .iter()
        .map(|p| p.revents & libc::POLLIN != 0)
        .collect())
}
