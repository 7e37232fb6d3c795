//! Readiness waiting over a small set of file descriptors.
//!
//! Both worker loops in this stack block on exactly two descriptors: their
//! socket and their wake pipe. This module wraps `poll(2)` once so neither
//! loop carries its own `pollfd` plumbing.
//!
//! # Safety
//!
//! This module uses unsafe code for the single `poll(2)` call. The unsafe
//! operation is encapsulated and safe to use from the public API.

#![allow(unsafe_code)]

use smallvec::SmallVec;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// What to wait for on one descriptor.
#[derive(Debug, Clone, Copy)]
pub struct Interest {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    #[must_use]
    pub const fn readable(fd: RawFd) -> Self {
        Self {
            fd,
            readable: true,
            writable: false,
        }
    }

    #[must_use]
    pub const fn writable(fd: RawFd) -> Self {
        Self {
            fd,
            readable: false,
            writable: true,
        }
    }

    #[must_use]
    pub const fn both(fd: RawFd) -> Self {
        Self {
            fd,
            readable: true,
            writable: true,
        }
    }
}

/// What a descriptor reported back.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
    /// Peer hung up (`POLLHUP`).
    pub hangup: bool,
    /// `POLLERR` or `POLLNVAL` — the descriptor is in trouble.
    pub error: bool,
}

impl Ready {
    /// Anything at all happened on this descriptor.
    #[must_use]
    pub const fn any(&self) -> bool {
        self.readable || self.writable || self.hangup || self.error
    }
}

/// Block until at least one descriptor is ready or the timeout lapses.
///
/// `None` blocks indefinitely. Results are positional: `ready[i]`
/// corresponds to `interests[i]`. A lapsed timeout yields all-default
/// entries. `EINTR` is retried transparently.
pub fn wait(
    interests: &[Interest],
    timeout: Option<Duration>,
) -> io::Result<SmallVec<[Ready; 2]>> {
    let mut fds: SmallVec<[libc::pollfd; 2]> = interests
        .iter()
        .map(|interest| {
            let mut events: libc::c_short = 0;
            if interest.readable {
                events |= libc::POLLIN;
            }
            if interest.writable {
                events |= libc::POLLOUT;
            }
            libc::pollfd {
                fd: interest.fd,
                events,
                revents: 0,
            }
        })
        .collect();

    let timeout_ms: libc::c_int = match timeout {
        None => -1,
        Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    };

    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        break;
    }

    Ok(fds
        .iter()
        .map(|fd| Ready {
            readable: fd.revents & libc::POLLIN != 0,
            writable: fd.revents & libc::POLLOUT != 0,
            hangup: fd.revents & libc::POLLHUP != 0,
            error: fd.revents & (libc::POLLERR | libc::POLLNVAL) != 0,
        })
        .collect())
}
