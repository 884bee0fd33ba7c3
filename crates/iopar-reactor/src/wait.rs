//! The single blocking point of the loop.

use core::time::Duration;
use std::io;
use std::os::fd::BorrowedFd;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::trace;

/// Block until one of `fds` is readable or `timeout` elapses.
///
/// Returns the indices (into `fds`) that are readable or in an error/hangup
/// state, so the owner gets a chance to notice EOF. `None` waits forever.
/// An interrupted wait (EINTR) yields an empty set; the caller simply loops.
pub fn wait_readable(fds: &[BorrowedFd<'_>], timeout: Option<Duration>) -> io::Result<Vec<usize>> {
    let mut pollfds: Vec<PollFd<'_>> = fds
        .iter()
        .map(|fd| PollFd::new(*fd, PollFlags::POLLIN))
        .collect();

    let timeout = match timeout {
        None => PollTimeout::NONE,
        Some(d) => {
            // Round up so a sub-millisecond deadline does not spin.
            let ms = d.as_micros().div_ceil(1000).min(u128::from(u16::MAX));
            PollTimeout::from(ms as u16)
        }
    };

    match poll(&mut pollfds, timeout) {
        Ok(0) => Ok(Vec::new()),
        Ok(_) => {
            let wanted = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
            Ok(pollfds
                .iter()
                .enumerate()
                .filter(|(_, p)| p.revents().is_some_and(|r| r.intersects(wanted)))
                .map(|(idx, _)| idx)
                .collect())
        }
        Err(Errno::EINTR) => {
            trace!(target: "iopar.reactor", "poll interrupted");
            Ok(Vec::new())
        }
        Err(errno) => Err(io::Error::from(errno)),
    }
}
