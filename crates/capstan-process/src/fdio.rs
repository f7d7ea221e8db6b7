//! Raw-descriptor helpers shared by the fork-side code paths.

use std::os::fd::{AsFd, RawFd};

use nix::errno::Errno;

/// Best-effort full write: short writes continue, interruptions retry, and
/// any other failure abandons the remainder. The fork-side callers have
/// nobody to report to; an incomplete payload speaks for itself.
pub(crate) fn write_fully(fd: impl AsFd, mut payload: &[u8]) {
    let sink = fd.as_fd();
    while !payload.is_empty() {
        match nix::unistd::write(sink, payload) {
            Ok(0) => return,
            Ok(written) => payload = payload.get(written..).unwrap_or_default(),
            Err(Errno::EINTR) => {}
            Err(_) => return,
        }
    }
}

/// Clears `FD_CLOEXEC` so the descriptor survives `exec`.
pub(crate) fn clear_cloexec(fd: RawFd) -> Result<(), Errno> {
    // SAFETY: the caller keeps the descriptor open across the call.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(Errno::last());
    }
    // SAFETY: as above; only the close-on-exec bit changes.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(Errno::last());
    }
    Ok(())
}

/// Points `target` at the same open file as `fd`.
pub(crate) fn redirect(fd: RawFd, target: RawFd) -> Result<(), Errno> {
    // SAFETY: dup2 atomically closes and replaces `target`; both
    // descriptors belong to the calling process.
    if unsafe { libc::dup2(fd, target) } < 0 {
        return Err(Errno::last());
    }
    Ok(())
}
