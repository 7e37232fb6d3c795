//! Level-triggered wake signal backed by a self-pipe.
//!
//! Worker threads in this stack block in `poll(2)` on their socket; the
//! owning thread wakes them by making one extra file descriptor readable.
//! This module provides that descriptor.
//!
//! # Safety
//!
//! This module uses unsafe code to create and drive a raw POSIX pipe. The
//! unsafe operations are encapsulated and safe to use from the public API.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

/// A level-sensitive signal exposing a file descriptor that may be used in
/// `poll(2)` to wait for it.
///
/// [`set`](Self::set) makes the descriptor readable and it stays readable
/// until [`clear`](Self::clear). Both ends are non-blocking, so a worker
/// that never drains the pipe cannot wedge a fast-path `set` caller.
#[derive(Debug)]
pub struct SignalPipe {
    read: OwnedFd,
    write: OwnedFd,
    signaled: AtomicBool,
}

impl SignalPipe {
    /// Create the pipe. Both ends get `O_NONBLOCK` and `FD_CLOEXEC`.
    pub fn new() -> io::Result<Self> {
        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        // Wrap immediately so a failure below still closes both ends.
        let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        set_nonblocking_cloexec(read.as_raw_fd())?;
        set_nonblocking_cloexec(write.as_raw_fd())?;
        Ok(Self {
            read,
            write,
            signaled: AtomicBool::new(false),
        })
    }

    /// Raise the signal, making [`wait_fd`](Self::wait_fd) readable.
    ///
    /// Idempotent at the descriptor level: only the first `set` after a
    /// `clear` writes to the pipe.
    pub fn set(&self) {
        if self.signaled.swap(true, Ordering::AcqRel) {
            return;
        }
        let byte = [1_u8];
        let n = unsafe {
            libc::write(
                self.write.as_raw_fd(),
                byte.as_ptr().cast::<libc::c_void>(),
                1,
            )
        };
        if n < 0 {
            // A full pipe still leaves the read end readable, which is all
            // the contract requires.
            tracing::trace!(
                error = %io::Error::last_os_error(),
                "signal pipe write failed"
            );
        }
    }

    /// Lower the signal and drain any pending bytes from the pipe.
    pub fn clear(&self) {
        // Drain first: lowering the flag before the drain can consume a
        // racing set's byte while leaving the stale flag to suppress the
        // next one.
        let mut buf = [0_u8; 16];
        loop {
            let n = unsafe {
                libc::read(
                    self.read.as_raw_fd(),
                    buf.as_mut_ptr().cast::<libc::c_void>(),
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
        }
        self.signaled.store(false, Ordering::Release);
    }

    /// Whether the signal is currently raised.
    #[inline]
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// The descriptor to include in a `poll(2)` set; readable while the
    /// signal is raised.
    #[inline]
    #[must_use]
    pub fn wait_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

fn set_nonblocking_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
