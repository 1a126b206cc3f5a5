//! Non-blocking BSD socket layer.
//!
//! This is the only module touching raw descriptors; everything above it works
//! with the safe [`HostSocket`] wrapper, which owns its descriptor and closes
//! it on drop. Every socket is created non-blocking, so the multiplexer never
//! blocks the emulation loop.

use std::io;
use std::os::unix::io::RawFd;

use thiserror::Error;

/// A host socket creation/setup failure, tagged with the failing operation so
/// diagnostics can name it without the callers threading strings around.
#[derive(Debug, Error)]
pub(crate) enum HostError {
    #[error("socket() failed: {0}")]
    Create(#[source] io::Error),
    #[error("could not make descriptor non-blocking: {0}")]
    Nonblocking(#[source] io::Error),
    #[error("setsockopt(SO_REUSEADDR) failed: {0}")]
    ReuseAddr(#[source] io::Error),
}

/// Outcome of a (re-)issued non-blocking `connect()`.
#[derive(Debug)]
pub(crate) enum ConnectProgress {
    Connected,
    InProgress,
    Failed(io::Error),
}

#[cfg(target_os = "linux")]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: libc::c_int = 0;

fn sockaddr_v4(ip: [u8; 4], port: u16) -> libc::sockaddr_in {
    // SAFETY: sockaddr_in is plain old data; an all-zero value is valid.
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr = libc::in_addr {
        s_addr: u32::from_ne_bytes(ip),
    };
    addr
}

const SOCKADDR_IN_LEN: libc::socklen_t = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

/// An owned, non-blocking IPv4 host socket.
#[derive(Debug)]
pub(crate) struct HostSocket {
    fd: RawFd,
}

impl Drop for HostSocket {
    fn drop(&mut self) {
        // SAFETY: `fd` is owned by this wrapper and closed exactly once.
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl HostSocket {
    pub(crate) fn tcp() -> Result<Self, HostError> {
        Self::create(libc::SOCK_STREAM)
    }

    pub(crate) fn udp() -> Result<Self, HostError> {
        Self::create(libc::SOCK_DGRAM)
    }

    fn create(kind: libc::c_int) -> Result<Self, HostError> {
        // SAFETY: plain socket(2) call; the return value is checked.
        let fd = unsafe { libc::socket(libc::AF_INET, kind, 0) };
        if fd < 0 {
            return Err(HostError::Create(io::Error::last_os_error()));
        }
        let sock = Self { fd };
        sock.set_nonblocking().map_err(HostError::Nonblocking)?;
        sock.set_reuseaddr().map_err(HostError::ReuseAddr)?;
        Ok(sock)
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        // SAFETY: fcntl(2) on an owned descriptor.
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: as above.
        let rc = unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_reuseaddr(&self) -> io::Result<()> {
        let one: libc::c_int = 1;
        // SAFETY: option value points at a live c_int of the advertised size.
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn raw_fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn bind(&self, ip: [u8; 4], port: u16) -> io::Result<()> {
        let addr = sockaddr_v4(ip, port);
        // SAFETY: addr is a valid sockaddr_in of the advertised length.
        let rc = unsafe {
            libc::bind(
                self.fd,
                &addr as *const _ as *const libc::sockaddr,
                SOCKADDR_IN_LEN,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn listen(&self, backlog: libc::c_int) -> io::Result<()> {
        // SAFETY: plain listen(2) call.
        let rc = unsafe { libc::listen(self.fd, backlog) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accept one pending connection. The returned socket is made non-blocking
    /// (accepted descriptors do not inherit `O_NONBLOCK`).
    pub(crate) fn accept(&self) -> io::Result<HostSocket> {
        // SAFETY: addr out-params are a valid sockaddr_in and its length.
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = SOCKADDR_IN_LEN;
        // SAFETY: as above.
        let fd = unsafe {
            libc::accept(
                self.fd,
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock = HostSocket { fd };
        sock.set_nonblocking()?;
        Ok(sock)
    }

    /// Issue (or re-issue) a non-blocking `connect()`.
    ///
    /// Re-issuing is the standard completion idiom: `EALREADY`/`EINPROGRESS`
    /// while the handshake is in flight, `EISCONN` once it completed, and the
    /// pending socket error once it failed.
    pub(crate) fn connect(&self, ip: [u8; 4], port: u16) -> ConnectProgress {
        let addr = sockaddr_v4(ip, port);
        // SAFETY: addr is a valid sockaddr_in of the advertised length.
        let rc = unsafe {
            libc::connect(
                self.fd,
                &addr as *const _ as *const libc::sockaddr,
                SOCKADDR_IN_LEN,
            )
        };
        if rc == 0 {
            return ConnectProgress::Connected;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EISCONN) => ConnectProgress::Connected,
            Some(libc::EINPROGRESS) | Some(libc::EALREADY) | Some(libc::EWOULDBLOCK)
            | Some(libc::EINTR) => ConnectProgress::InProgress,
            _ => ConnectProgress::Failed(err),
        }
    }

    pub(crate) fn send(&self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: buf points at `buf.len()` initialized bytes.
        let n = unsafe { libc::send(self.fd, buf.as_ptr() as *const libc::c_void, buf.len(), SEND_FLAGS) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub(crate) fn send_to(&self, buf: &[u8], ip: [u8; 4], port: u16) -> io::Result<usize> {
        let addr = sockaddr_v4(ip, port);
        // SAFETY: buf and addr are live for the duration of the call.
        let n = unsafe {
            libc::sendto(
                self.fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                SEND_FLAGS,
                &addr as *const _ as *const libc::sockaddr,
                SOCKADDR_IN_LEN,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    pub(crate) fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf points at `buf.len()` writable bytes.
        let n = unsafe { libc::recv(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    /// Receive one datagram, returning its length and source endpoint.
    pub(crate) fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, [u8; 4], u16)> {
        // SAFETY: out-params are a valid sockaddr_in and its length.
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = SOCKADDR_IN_LEN;
        // SAFETY: buf points at `buf.len()` writable bytes.
        let n = unsafe {
            libc::recvfrom(
                self.fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut addr as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let ip = addr.sin_addr.s_addr.to_ne_bytes();
        let port = u16::from_be(addr.sin_port);
        Ok((n as usize, ip, port))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Interest {
    pub read: bool,
    pub write: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub read: bool,
    pub write: bool,
}

/// Zero-timeout readiness check over a set of descriptors.
///
/// Error and hangup conditions are folded into readability/writability so the
/// per-socket handlers observe them through their normal I/O path (EOF on
/// read, pending error on the connect re-attempt).
pub(crate) fn poll_ready(fds: &[(RawFd, Interest)]) -> Vec<Readiness> {
    let mut pfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|(fd, interest)| {
            let mut events: libc::c_short = 0;
            if interest.read {
                events |= libc::POLLIN;
            }
            if interest.write {
                events |= libc::POLLOUT;
            }
            libc::pollfd {
                fd: *fd,
                events,
                revents: 0,
            }
        })
        .collect();

    // SAFETY: pfds is a live array of pfds.len() pollfd entries; zero timeout.
    let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, 0) };
    if rc < 0 {
        tracing::debug!("poll() failed: {}", io::Error::last_os_error());
        return vec![Readiness::default(); fds.len()];
    }

    pfds.iter()
        .map(|p| {
            let fail = p.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
            Readiness {
                read: p.revents & libc::POLLIN != 0 || fail,
                write: p.revents & libc::POLLOUT != 0 || fail,
            }
        })
        .collect()
}
