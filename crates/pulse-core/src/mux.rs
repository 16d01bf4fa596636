//! Readiness multiplexer.
//!
//! One uniform contract over several back-ends: wait up to `timeout_msec`
//! (negative blocks, zero polls once) and report which registered descriptors
//! are readable. The multiplexer never reads from a socket itself. `EINTR`
//! surfaces as "nothing ready" and callers re-enter; any other failure is
//! fatal for the run.
//!
//! The back-end is chosen once at startup and dispatched through a plain
//! `match`: no per-call allocation, no virtual dispatch. A kernel-bypass
//! "extreme dispatch" back-end (readiness plus first packet in one call)
//! would slot into the same enum; none is linked here.

use std::io;
use std::os::unix::io::RawFd;
use std::str::FromStr;

use crate::error::{PulseError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxKind {
    /// No readiness tracking: the single registered descriptor is always
    /// reported ready and the caller blocks in recv itself.
    RecvFrom,
    Select,
    Poll,
    Epoll,
}

impl FromStr for MuxKind {
    type Err = PulseError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "recvfrom" => Ok(MuxKind::RecvFrom),
            "select" => Ok(MuxKind::Select),
            "poll" => Ok(MuxKind::Poll),
            "epoll" => Ok(MuxKind::Epoll),
            other => Err(PulseError::BadArgument(format!(
                "unknown fd handler '{}' (expected recvfrom|select|poll|epoll)",
                other
            ))),
        }
    }
}

pub struct IoMux {
    kind: MuxKind,
    fds: Vec<RawFd>,
    epfd: RawFd,
    pollfds: Vec<libc::pollfd>,
    events: Vec<libc::epoll_event>,
    ready: Vec<RawFd>,
}

impl IoMux {
    pub fn new(kind: MuxKind) -> Result<Self> {
        let epfd = match kind {
            MuxKind::Epoll => {
                let fd = unsafe { libc::epoll_create1(0) };
                if fd < 0 {
                    return Err(PulseError::socket("epoll_create1"));
                }
                fd
            }
            _ => -1,
        };
        Ok(IoMux {
            kind,
            fds: Vec::new(),
            epfd,
            pollfds: Vec::new(),
            events: Vec::new(),
            ready: Vec::new(),
        })
    }

    pub fn kind(&self) -> MuxKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.fds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    pub fn add(&mut self, fd: RawFd) -> Result<()> {
        if self.kind == MuxKind::RecvFrom && !self.fds.is_empty() {
            return Err(PulseError::Unsupported(
                "the recvfrom handler drives exactly one socket".into(),
            ));
        }
        if self.fds.contains(&fd) {
            return Ok(());
        }
        match self.kind {
            MuxKind::Epoll => {
                let mut ev = libc::epoll_event { events: libc::EPOLLIN as u32, u64: fd as u64 };
                let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut ev) };
                if rc != 0 {
                    return Err(PulseError::socket("epoll_ctl(ADD)"));
                }
                self.events.push(unsafe { std::mem::zeroed() });
            }
            MuxKind::Poll => {
                self.pollfds.push(libc::pollfd { fd, events: libc::POLLIN, revents: 0 });
            }
            _ => {}
        }
        self.fds.push(fd);
        Ok(())
    }

    pub fn remove(&mut self, fd: RawFd) -> Result<()> {
        let Some(ix) = self.fds.iter().position(|&f| f == fd) else {
            return Ok(());
        };
        self.fds.swap_remove(ix);
        match self.kind {
            MuxKind::Epoll => {
                let rc = unsafe {
                    libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
                };
                if rc != 0 {
                    return Err(PulseError::socket("epoll_ctl(DEL)"));
                }
                self.events.pop();
            }
            MuxKind::Poll => {
                if let Some(pix) = self.pollfds.iter().position(|p| p.fd == fd) {
                    self.pollfds.swap_remove(pix);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Wait for readability. Negative timeout blocks, zero polls once, a
    /// positive value is a cooperative upper bound in milliseconds. Returns
    /// the readable subset; empty on timeout or `EINTR`.
    pub fn wait(&mut self, timeout_msec: i64) -> Result<&[RawFd]> {
        self.ready.clear();
        match self.kind {
            MuxKind::RecvFrom => {
                // Readiness is discovered by the blocking recv itself.
                self.ready.extend_from_slice(&self.fds);
                Ok(&self.ready)
            }
            MuxKind::Select => self.wait_select(timeout_msec),
            MuxKind::Poll => self.wait_poll(timeout_msec),
            MuxKind::Epoll => self.wait_epoll(timeout_msec),
        }
    }

    fn wait_select(&mut self, timeout_msec: i64) -> Result<&[RawFd]> {
        let mut readfds: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut readfds);
        }
        let mut nfds = 0;
        for &fd in &self.fds {
            unsafe {
                libc::FD_SET(fd, &mut readfds);
            }
            nfds = nfds.max(fd + 1);
        }
        let mut tv = libc::timeval {
            tv_sec: timeout_msec / 1000,
            tv_usec: (timeout_msec % 1000) * 1000,
        };
        let tv_ptr = if timeout_msec < 0 { std::ptr::null_mut() } else { &mut tv as *mut _ };
        let rc = unsafe { libc::select(nfds, &mut readfds, std::ptr::null_mut(), std::ptr::null_mut(), tv_ptr) };
        if rc < 0 {
            return match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => Ok(&self.ready),
                _ => Err(PulseError::socket("select")),
            };
        }
        for &fd in &self.fds {
            if unsafe { libc::FD_ISSET(fd, &readfds) } {
                self.ready.push(fd);
            }
        }
        Ok(&self.ready)
    }

    fn wait_poll(&mut self, timeout_msec: i64) -> Result<&[RawFd]> {
        let timeout = if timeout_msec < 0 { -1 } else { timeout_msec.min(i32::MAX as i64) as i32 };
        let rc = unsafe { libc::poll(self.pollfds.as_mut_ptr(), self.pollfds.len() as libc::nfds_t, timeout) };
        if rc < 0 {
            return match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => Ok(&self.ready),
                _ => Err(PulseError::socket("poll")),
            };
        }
        for p in &self.pollfds {
            if p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                self.ready.push(p.fd);
            }
        }
        Ok(&self.ready)
    }

    fn wait_epoll(&mut self, timeout_msec: i64) -> Result<&[RawFd]> {
        if self.events.is_empty() {
            return Ok(&self.ready);
        }
        let timeout = if timeout_msec < 0 { -1 } else { timeout_msec.min(i32::MAX as i64) as i32 };
        let rc = unsafe {
            libc::epoll_wait(self.epfd, self.events.as_mut_ptr(), self.events.len() as i32, timeout)
        };
        if rc < 0 {
            return match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => Ok(&self.ready),
                _ => Err(PulseError::socket("epoll_wait")),
            };
        }
        for ev in &self.events[..rc as usize] {
            self.ready.push(ev.u64 as RawFd);
        }
        Ok(&self.ready)
    }
}

impl Drop for IoMux {
    fn drop(&mut self) {
        if self.epfd >= 0 {
            unsafe {
                libc::close(self.epfd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{PeerAddr, SockKind, SocketSpec};
    use crate::registry::{prepare_socket, send_message, Role, SocketOptions};

    fn udp_pair() -> (crate::registry::SocketRecord, crate::registry::SocketRecord) {
        let spec = SocketSpec::new(SockKind::Dgram, PeerAddr::V4("127.0.0.1:0".parse().unwrap()));
        let server = prepare_socket(&spec, &SocketOptions::default(), Role::Server, 64).unwrap();
        let target = SocketSpec::new(SockKind::Dgram, server.local_addr().unwrap());
        let client = prepare_socket(&target, &SocketOptions::default(), Role::Client, 64).unwrap();
        (server, client)
    }

    fn check_backend(kind: MuxKind) {
        let (server, client) = udp_pair();
        let mut mux = IoMux::new(kind).unwrap();
        mux.add(server.fd()).unwrap();

        // nothing queued: a zero timeout polls and comes back empty
        assert!(mux.wait(0).unwrap().is_empty());

        let dest = server.local_addr().unwrap().to_sock_addr().unwrap();
        send_message(client.fd(), &[0u8; 14], Some(&dest), false);
        // bounded wait sees the readiness
        let ready = mux.wait(1000).unwrap().to_vec();
        assert_eq!(ready, vec![server.fd()]);

        mux.remove(server.fd()).unwrap();
        assert!(mux.wait(0).unwrap().is_empty());
    }

    #[test]
    fn test_select_backend() {
        check_backend(MuxKind::Select);
    }

    #[test]
    fn test_poll_backend() {
        check_backend(MuxKind::Poll);
    }

    #[test]
    fn test_epoll_backend() {
        check_backend(MuxKind::Epoll);
    }

    #[test]
    fn test_recvfrom_backend_is_single_fd() {
        let (server, _client) = udp_pair();
        let mut mux = IoMux::new(MuxKind::RecvFrom).unwrap();
        mux.add(server.fd()).unwrap();
        assert_eq!(mux.wait(0).unwrap().to_vec(), vec![server.fd()]);
        let err = mux.add(server.fd() + 1).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("epoll".parse::<MuxKind>().unwrap(), MuxKind::Epoll);
        assert_eq!("select".parse::<MuxKind>().unwrap(), MuxKind::Select);
        assert!("kqueue".parse::<MuxKind>().is_err());
    }
}
