// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Non-blocking descriptor I/O for tasks.
//!
//! Each operation tries the syscall first. On EAGAIN the task parks on the
//! descriptor with [`readable`]/[`writable`] and retries once woken. The
//! descriptor must already be in non-blocking mode (see [`set_nonblocking`]).

use std::io;
use std::os::unix::io::RawFd;

use crate::syscall::{readable, writable};

/// Read into `buf`, parking until the descriptor is readable if needed.
/// Returns `Ok(0)` at end of file.
pub async fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => readable(fd).await?,
            _ => return Err(err),
        }
    }
}

/// Write from `buf`, parking until the descriptor is writable if needed.
/// May write fewer bytes than requested.
pub async fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => writable(fd).await?,
            _ => return Err(err),
        }
    }
}

/// Write all of `buf`.
pub async fn write_all(fd: RawFd, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match write(fd, buf).await? {
            0 => return Err(io::ErrorKind::WriteZero.into()),
            n => buf = &buf[n..],
        }
    }
    Ok(())
}

/// Put `fd` into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_nonblocking_is_idempotent() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);

        set_nonblocking(fds[0]).unwrap();
        set_nonblocking(fds[0]).unwrap();
        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL) };
        assert_ne!(flags & libc::O_NONBLOCK, 0);

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn bad_descriptor() {
        assert!(set_nonblocking(-1).is_err());
    }
}
