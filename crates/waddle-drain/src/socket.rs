//! Socket glue: binding reuseport sockets, deriving their identity, and
//! watching their receive queue while they drain.

use std::io;
use std::net::{SocketAddr, TcpListener, UdpSocket};
use std::os::fd::{AsFd, AsRawFd};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::error::DrainError;
use crate::identity::SocketId;

/// Default listen backlog for reuseport TCP listeners.
pub const DEFAULT_BACKLOG: i32 = 1024;

/// Bind a UDP socket with `SO_REUSEADDR` and `SO_REUSEPORT` set, so other
/// sockets (in this or another process) can join the same group.
pub fn bind_reuseport_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = reuseport_socket(addr, Type::DGRAM, Protocol::UDP)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Bind and listen on a TCP socket with `SO_REUSEADDR` and `SO_REUSEPORT`.
pub fn bind_reuseport_tcp(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = reuseport_socket(addr, Type::STREAM, Protocol::TCP)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

fn reuseport_socket(addr: SocketAddr, ty: Type, protocol: Protocol) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    Ok(socket)
}

/// Identity of a live kernel socket, read from `SO_COOKIE`.
///
/// The kernel assigns each socket a non-zero cookie that is unique for the
/// lifetime of the host boot, so it is stable for as long as the socket lives
/// and never shared with another socket.
#[cfg(target_os = "linux")]
pub fn socket_cookie<F: AsFd>(socket: &F) -> Result<SocketId, DrainError> {
    let fd = socket.as_fd().as_raw_fd();
    let mut cookie: u64 = 0;
    let mut len = std::mem::size_of::<u64>() as libc::socklen_t;

    // SAFETY: `fd` is borrowed from a live socket and `cookie`/`len` describe
    // a valid 8-byte buffer for the duration of the call.
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_COOKIE,
            &mut cookie as *mut u64 as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(SocketId::from_raw(cookie))
}

#[cfg(not(target_os = "linux"))]
pub fn socket_cookie<F: AsFd>(_socket: &F) -> Result<SocketId, DrainError> {
    Err(DrainError::Unsupported("SO_COOKIE"))
}

/// Bytes waiting in the socket's receive queue (`FIONREAD`).
///
/// For UDP sockets on Linux this is the size of the next datagram only, so
/// treat it as a lower bound.
pub fn pending_bytes<F: AsFd>(socket: &F) -> io::Result<usize> {
    let fd = socket.as_fd().as_raw_fd();
    let mut pending: libc::c_int = 0;

    // SAFETY: `fd` is borrowed from a live socket and FIONREAD writes a
    // single c_int into `pending`.
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut pending) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(usize::try_from(pending).unwrap_or(0))
}

/// Polling schedule for [`wait_until_empty`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmptyWaitConfig {
    /// Delay after the first poll.
    pub initial_backoff: Duration,
    /// Upper bound for the doubling delay.
    pub max_backoff: Duration,
    /// Maximum number of polls before giving up.
    pub max_attempts: u32,
    /// Consecutive empty polls needed to call the socket drained.
    pub zero_streak: u32,
}

impl Default for EmptyWaitConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            max_attempts: 6,
            zero_streak: 3,
        }
    }
}

/// Poll a draining socket until its receive queue reads empty
/// `zero_streak` times in a row, backing off exponentially between polls.
///
/// Returns `0` once drained, otherwise the last (at-least) pending byte count
/// after `max_attempts` polls, with at least one poll. Only meaningful once the
/// socket is excluded from selection, since new datagrams would otherwise keep
/// arriving.
pub async fn wait_until_empty<F: AsFd>(
    socket: &F,
    config: &EmptyWaitConfig,
) -> Result<usize, DrainError> {
    let mut backoff = config.initial_backoff;
    let mut zero_streak = 0;
    let mut remaining = 0;

    for attempt in 0..config.max_attempts.max(1) {
        remaining = pending_bytes(socket)?;
        if remaining == 0 {
            zero_streak += 1;
            if zero_streak >= config.zero_streak {
                return Ok(0);
            }
        } else {
            zero_streak = 0;
        }

        debug!(
            attempt,
            remaining,
            backoff_ms = backoff.as_millis() as u64,
            "Socket not drained yet"
        );
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(config.max_backoff);
    }

    Ok(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// Block until the receiver reports queued bytes.
    fn wait_for_datagram(receiver: &UdpSocket) -> usize {
        for _ in 0..50 {
            let seen = pending_bytes(receiver).unwrap();
            if seen > 0 {
                return seen;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        0
    }

    #[test]
    fn test_two_udp_sockets_share_port() {
        let first = bind_reuseport_udp(localhost()).unwrap();
        let addr = first.local_addr().unwrap();
        let second = bind_reuseport_udp(addr).unwrap();
        assert_eq!(second.local_addr().unwrap(), addr);
    }

    #[test]
    fn test_two_tcp_listeners_share_port() {
        let first = bind_reuseport_tcp(localhost(), DEFAULT_BACKLOG).unwrap();
        let addr = first.local_addr().unwrap();
        let second = bind_reuseport_tcp(addr, DEFAULT_BACKLOG).unwrap();
        assert_eq!(second.local_addr().unwrap().port(), addr.port());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_cookie_is_stable_and_distinct() {
        let first = bind_reuseport_udp(localhost()).unwrap();
        let second = bind_reuseport_udp(first.local_addr().unwrap()).unwrap();

        let a = socket_cookie(&first).unwrap();
        let b = socket_cookie(&second).unwrap();
        assert_ne!(a.as_raw(), 0);
        assert_ne!(a, b);
        assert_eq!(socket_cookie(&first).unwrap(), a);
    }

    #[test]
    fn test_pending_bytes_sees_queued_datagram() {
        let receiver = bind_reuseport_udp(localhost()).unwrap();
        let sender = UdpSocket::bind(localhost()).unwrap();
        assert_eq!(pending_bytes(&receiver).unwrap(), 0);

        sender
            .send_to(b"hello", receiver.local_addr().unwrap())
            .unwrap();

        assert_eq!(wait_for_datagram(&receiver), 5);

        let mut buf = [0u8; 16];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(pending_bytes(&receiver).unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_empty_on_idle_socket() {
        let socket = bind_reuseport_udp(localhost()).unwrap();
        let remaining = wait_until_empty(&socket, &EmptyWaitConfig::default())
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_empty_gives_up_on_backlog() {
        let receiver = bind_reuseport_udp(localhost()).unwrap();
        let sender = UdpSocket::bind(localhost()).unwrap();
        sender
            .send_to(b"queued", receiver.local_addr().unwrap())
            .unwrap();
        assert_eq!(wait_for_datagram(&receiver), 6);

        let config = EmptyWaitConfig {
            max_attempts: 3,
            ..EmptyWaitConfig::default()
        };
        let remaining = wait_until_empty(&receiver, &config).await.unwrap();
        assert_eq!(remaining, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_empty_zero_attempts_still_polls() {
        let receiver = bind_reuseport_udp(localhost()).unwrap();
        let sender = UdpSocket::bind(localhost()).unwrap();
        sender
            .send_to(b"queued", receiver.local_addr().unwrap())
            .unwrap();
        assert_eq!(wait_for_datagram(&receiver), 6);

        let config = EmptyWaitConfig {
            max_attempts: 0,
            ..EmptyWaitConfig::default()
        };
        let remaining = wait_until_empty(&receiver, &config).await.unwrap();
        assert_eq!(remaining, 6);
    }
}
