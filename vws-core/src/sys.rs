//! OS-level helpers: readiness polling on a raw descriptor and address
//! formatting.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::Duration;

/// What to wait for in [`poll_fd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Outcome of one [`poll_fd`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
    /// POLLERR/POLLHUP/POLLNVAL without the requested event.
    Hangup,
}

/// Wait up to `timeout` for `fd` to become readable or writable. EINTR is
/// retried with the time that remains.
pub fn poll_fd(fd: RawFd, interest: Interest, timeout: Duration) -> io::Result<Readiness> {
    let events = match interest {
        Interest::Read => libc::POLLIN,
        Interest::Write => libc::POLLOUT,
    };
    let deadline = std::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(std::time::Instant::now());
        let ms = remaining.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
        let mut pollfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        // SAFETY: `pollfd` is a valid, exclusively borrowed array of length 1.
        let rc = unsafe { libc::poll(&mut pollfd, 1, ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Ok(Readiness::TimedOut);
        }
        if pollfd.revents & events != 0 {
            return Ok(Readiness::Ready);
        }
        if pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return Ok(Readiness::Hangup);
        }
    }
}

/// Printable host and port of a socket address.
pub fn addr_info(addr: &SocketAddr) -> (String, u16) {
    (addr.ip().to_string(), addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::fd::AsRawFd;
    use std::time::Instant;

    #[test]
    fn addr_info_v4_and_v6() {
        let v4: SocketAddr = "127.0.0.1:8181".parse().unwrap();
        assert_eq!(addr_info(&v4), ("127.0.0.1".to_string(), 8181));
        let v6: SocketAddr = "[::1]:443".parse().unwrap();
        assert_eq!(addr_info(&v6), ("::1".to_string(), 443));
    }

    #[test]
    fn poll_times_out_then_becomes_readable() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let start = Instant::now();
        let r = poll_fd(client.as_raw_fd(), Interest::Read, Duration::from_millis(100)).unwrap();
        assert_eq!(r, Readiness::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(90));

        assert_eq!(
            poll_fd(client.as_raw_fd(), Interest::Write, Duration::from_millis(100)).unwrap(),
            Readiness::Ready
        );

        server.write_all(b"x").unwrap();
        let r = poll_fd(client.as_raw_fd(), Interest::Read, Duration::from_secs(2)).unwrap();
        assert_eq!(r, Readiness::Ready);
    }
}
