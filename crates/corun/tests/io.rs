// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Descriptor I/O from tasks.

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

use corun::{io, Scheduler, TaskError};
use parking_lot::Mutex;

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    assert_eq!(ret, 0);
    io::set_nonblocking(fds[0]).unwrap();
    io::set_nonblocking(fds[1]).unwrap();
    (fds[0], fds[1])
}

fn close(fd: RawFd) {
    unsafe { libc::close(fd) };
}

#[test]
fn echo_over_pipe() {
    let sched = Scheduler::new().unwrap();
    let (read_fd, write_fd) = pipe();
    let received = Arc::new(Mutex::new(Vec::new()));

    let r = received.clone();
    let reader = sched
        .submit(async move {
            let mut buf = [0u8; 64];
            loop {
                let n = io::read(read_fd, &mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                r.lock().extend_from_slice(&buf[..n]);
            }
        })
        .unwrap();

    let writer = sched
        .submit(async move {
            for chunk in [&b"hello "[..], b"from ", b"a task"] {
                corun::sleep(Duration::from_millis(5)).await;
                io::write_all(write_fd, chunk).await?;
            }
            close(write_fd);
            Ok(())
        })
        .unwrap();

    sched.join_all([writer, reader]).unwrap();
    assert_eq!(&*received.lock(), b"hello from a task");
    close(read_fd);
}

#[test]
fn large_write_waits_for_reader() {
    let sched = Scheduler::new().unwrap();
    let (read_fd, write_fd) = pipe();
    // Bigger than the default pipe buffer, so the writer must park.
    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let received = Arc::new(Mutex::new(Vec::new()));

    let writer = sched
        .submit(async move {
            io::write_all(write_fd, &payload).await?;
            close(write_fd);
            Ok(())
        })
        .unwrap();

    let r = received.clone();
    let reader = sched
        .submit(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                match io::read(read_fd, &mut buf).await? {
                    0 => return Ok(()),
                    n => r.lock().extend_from_slice(&buf[..n]),
                }
            }
        })
        .unwrap();

    sched.join_all([writer, reader]).unwrap();
    assert_eq!(*received.lock(), expected);
    close(read_fd);
}

#[test]
fn read_on_closed_descriptor_fails_the_task() {
    let failures = Arc::new(Mutex::new(Vec::new()));
    let f = failures.clone();
    let config = corun::Config::default().on_failure(move |_, err| f.lock().push(err.clone()));
    let sched = Scheduler::start(config).unwrap();

    let id = sched
        .submit(async {
            let mut buf = [0u8; 8];
            io::read(-1, &mut buf).await?;
            Ok::<(), TaskError>(())
        })
        .unwrap();

    sched.join_all([id]).unwrap();
    assert_eq!(failures.lock().len(), 1);
}
