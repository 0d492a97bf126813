//! UDP socket wrapper for RIST
//!
//! Non-blocking UDP with the socket options the engine needs. The protocol
//! layer treats this as a byte-datagram transport with addresses.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use thiserror::Error;

/// Socket configuration errors
#[derive(Error, Debug)]
pub enum SocketError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid socket address")]
    InvalidAddress,
}

impl SocketError {
    /// Whether this is a transient would-block condition
    pub fn is_would_block(&self) -> bool {
        matches!(self, SocketError::Io(e) if e.kind() == ErrorKind::WouldBlock)
    }
}

/// Non-blocking UDP socket
pub struct RistSocket {
    inner: Socket,
}

impl RistSocket {
    /// Create a socket bound to the given address
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.set_nonblocking(true)?;

        Ok(RistSocket { inner: socket })
    }

    /// Bind to an ephemeral local port suitable for reaching `remote`
    pub fn bind_for(remote: SocketAddr) -> Result<Self, SocketError> {
        let local: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().expect("static addr")
        } else {
            "[::]:0".parse().expect("static addr")
        };
        Self::bind(local)
    }

    pub fn set_send_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        self.inner.set_send_buffer_size(size)?;
        Ok(())
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> Result<(), SocketError> {
        self.inner.set_recv_buffer_size(size)?;
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        self.inner
            .local_addr()?
            .as_socket()
            .ok_or(SocketError::InvalidAddress)
    }

    /// Send a datagram; would-block surfaces as an error the caller may retry
    pub fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.inner.send_to(buf, &target.into())?)
    }

    /// Receive a datagram, or `None` when the socket has nothing ready
    pub fn try_recv_from(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        use std::mem::MaybeUninit;
        let uninit = unsafe {
            std::slice::from_raw_parts_mut(buf.as_mut_ptr() as *mut MaybeUninit<u8>, buf.len())
        };

        match self.inner.recv_from(uninit) {
            Ok((n, addr)) => Ok(Some((
                n,
                addr.as_socket().ok_or(SocketError::InvalidAddress)?,
            ))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(SocketError::Io(e)),
        }
    }

    pub fn try_clone(&self) -> Result<Self, SocketError> {
        Ok(RistSocket {
            inner: self.inner.try_clone()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_socket_creation() {
        let socket = RistSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = socket.local_addr().unwrap();
        assert!(addr.port() > 0);
    }

    #[test]
    fn test_socket_send_recv() {
        let sender = RistSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let receiver = RistSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();

        let receiver_addr = receiver.local_addr().unwrap();

        let data = b"rist datagram";
        sender.send_to(data, receiver_addr).unwrap();

        let mut buf = [0u8; 1500];
        for _ in 0..50 {
            if let Some((n, _addr)) = receiver.try_recv_from(&mut buf).unwrap() {
                assert_eq!(&buf[..n], data);
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("datagram never arrived");
    }

    #[test]
    fn test_empty_socket_returns_none() {
        let socket = RistSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut buf = [0u8; 64];
        assert!(socket.try_recv_from(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_bind_for_matches_family() {
        let socket = RistSocket::bind_for("192.0.2.1:9000".parse().unwrap()).unwrap();
        assert!(socket.local_addr().unwrap().is_ipv4());
    }
}
