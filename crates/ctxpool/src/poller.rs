// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Thin epoll wrapper.
//!
//! One epoll instance plus an eventfd registered in it, so `stop` can
//! interrupt a blocked `epoll_wait`. Tokens are context indices; the
//! eventfd uses `WAKE_TOKEN`.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::InitError;

pub(crate) const WAKE_TOKEN: u64 = u64::MAX;

pub(crate) struct Poller {
    epoll_fd: RawFd,
    wake_fd: RawFd,
}

impl Poller {
    pub fn new() -> Result<Self, InitError> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(InitError::Epoll(io::Error::last_os_error()));
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(InitError::WakeFd(err));
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        let ret = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(InitError::WakeFd(err));
        }

        Ok(Self { epoll_fd, wake_fd })
    }

    pub fn add(&self, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events, token)
    }

    pub fn modify(&self, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events, token)
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let ret = unsafe {
            libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut ev = libc::epoll_event { events, u64: token };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Block up to `timeout_ms` and fill `events`. EINTR reports zero events.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let max = events.len().min(i32::MAX as usize) as i32;
        let n = unsafe { libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), max, timeout_ms) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(n as usize)
    }

    /// Interrupt a thread blocked in `wait`.
    pub fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }

    /// Reset the eventfd after `WAKE_TOKEN` fired.
    pub fn drain_wake(&self) {
        let mut buf = [0u8; 8];
        unsafe {
            libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
        }
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close(fds: &[RawFd]) {
        for &fd in fds {
            unsafe { libc::close(fd) };
        }
    }

    fn empty_events(n: usize) -> Vec<libc::epoll_event> {
        vec![libc::epoll_event { events: 0, u64: 0 }; n]
    }

    const READ_ONESHOT: u32 = (libc::EPOLLIN | libc::EPOLLET | libc::EPOLLONESHOT) as u32;

    #[test]
    fn wait_times_out_with_no_events() {
        let poller = Poller::new().unwrap();
        let mut events = empty_events(4);
        assert_eq!(poller.wait(&mut events, 1).unwrap(), 0);
    }

    #[test]
    fn oneshot_fires_once_until_modified() {
        let poller = Poller::new().unwrap();
        let (r, w) = pipe();
        poller.add(r, READ_ONESHOT, 7).unwrap();
        unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };

        let mut events = empty_events(4);
        assert_eq!(poller.wait(&mut events, 100).unwrap(), 1);
        let token = events[0].u64;
        assert_eq!(token, 7);

        // Disarmed until re-armed.
        unsafe { libc::write(w, b"y".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(poller.wait(&mut events, 10).unwrap(), 0);

        poller.modify(r, READ_ONESHOT, 7).unwrap();
        assert_eq!(poller.wait(&mut events, 100).unwrap(), 1);
        close(&[r, w]);
    }

    #[test]
    fn modify_after_delete_is_enoent() {
        let poller = Poller::new().unwrap();
        let (r, w) = pipe();
        poller.add(r, READ_ONESHOT, 1).unwrap();
        poller.delete(r).unwrap();
        let err = poller.modify(r, READ_ONESHOT, 1).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
        close(&[r, w]);
    }

    #[test]
    fn wake_interrupts_wait() {
        let poller = Poller::new().unwrap();
        poller.wake();
        let mut events = empty_events(2);
        assert_eq!(poller.wait(&mut events, 1000).unwrap(), 1);
        let token = events[0].u64;
        assert_eq!(token, WAKE_TOKEN);
        poller.drain_wake();
        assert_eq!(poller.wait(&mut events, 1).unwrap(), 0);
    }
}
