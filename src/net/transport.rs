use crate::net::buffer::Buffer;
use crate::net::support::{ErrorType, NetworkError, NetworkResult};
use mio::net::TcpStream;
use std::io;
use std::net::{Shutdown, SocketAddr};

/// Thin duplex byte pipe over a non-blocking TCP stream (v4 or v6). Knows
/// nothing about framing or the protocol; reads drain into a caller-supplied
/// buffer and writes flush from one. Close is idempotent.
pub struct Transport {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl Transport {
    /// Start a non-blocking connect. The stream becomes usable once the
    /// driver observes writable readiness and `finish_connect` confirms.
    pub fn connect(addr: &SocketAddr) -> NetworkResult<Transport> {
        let stream = TcpStream::connect(addr)?;

        Ok(Transport {
            stream: Some(stream),
            peer: *addr,
        })
    }

    /// Wrap a stream handed over by the accept loop.
    #[inline]
    pub fn accepted(stream: TcpStream, peer: SocketAddr) -> Transport {
        Transport {
            stream: Some(stream),
            peer,
        }
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Resolve an in-flight connect after a writable readiness event.
    /// `Ok(true)` means the TCP handshake completed, `Ok(false)` that it is
    /// still in progress.
    pub fn finish_connect(&self) -> NetworkResult<bool> {
        let stream = self.stream.as_ref().ok_or(NetworkError::Fatal(ErrorType::ClosedByPeer))?;

        if let Some(err) = stream.take_error()? {
            return Err(err.into());
        }

        match stream.peer_addr() {
            Ok(_) => Ok(true),
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drain all readable bytes into the buffer. Returns the byte count;
    /// zero means no data was ready. Peer shutdown surfaces as
    /// `ClosedByPeer`.
    pub fn read_into(&mut self, buffer: &mut Buffer) -> NetworkResult<usize> {
        let stream = self.stream.as_ref().ok_or(NetworkError::Fatal(ErrorType::ClosedByPeer))?;

        buffer.ingress(&mut &*stream).map_err(Into::into)
    }

    /// Flush as much buffered data as the socket accepts. Returns the byte
    /// count written.
    pub fn write_from(&mut self, buffer: &mut Buffer) -> NetworkResult<usize> {
        let stream = self.stream.as_ref().ok_or(NetworkError::Fatal(ErrorType::ClosedByPeer))?;

        buffer.egress(&mut &*stream).map_err(Into::into)
    }

    /// Registers the transport on the supplied poll.
    pub fn register(&self, poll: &mio::Poll, token: mio::Token) -> NetworkResult<()> {
        let stream = self.stream.as_ref().ok_or(NetworkError::Fatal(ErrorType::ClosedByPeer))?;

        poll.register(
            stream,
            token,
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        )
        .map_err(Into::into)
    }

    /// Deregisters the transport from the supplied poll.
    pub fn deregister(&self, poll: &mio::Poll) -> NetworkResult<()> {
        let stream = self.stream.as_ref().ok_or(NetworkError::Fatal(ErrorType::ClosedByPeer))?;

        poll.deregister(stream).map_err(Into::into)
    }

    /// Shuts the stream down and releases it. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            // The peer may already be gone; nothing useful to do about it.
            drop(stream.shutdown(Shutdown::Both));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;
    use std::time::Duration;

    fn socket_pair() -> (Transport, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = std::net::TcpStream::connect(addr).unwrap();
        let (accepted, peer) = listener.accept().unwrap();

        accepted.set_nonblocking(true).unwrap();
        let transport = Transport::accepted(TcpStream::from_stream(accepted).unwrap(), peer);

        (transport, client)
    }

    #[test]
    fn test_read_into_drains_available_bytes() {
        let (mut transport, mut client) = socket_pair();

        client.write_all(&[1, 2, 3, 4]).unwrap();

        let mut buffer = Buffer::new(1024, 4096);

        // Data races the kernel; poll until it lands.
        let mut total = 0;
        for _ in 0..100 {
            total += transport.read_into(&mut buffer).unwrap();
            if total == 4 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(buffer.read_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_read_empty_socket_is_not_an_error() {
        let (mut transport, _client) = socket_pair();

        let mut buffer = Buffer::new(1024, 4096);
        assert_eq!(transport.read_into(&mut buffer).unwrap(), 0);
    }

    #[test]
    fn test_peer_close_is_fatal() {
        let (mut transport, client) = socket_pair();
        drop(client);

        let mut buffer = Buffer::new(1024, 4096);

        let mut result = Ok(0);
        for _ in 0..100 {
            result = transport.read_into(&mut buffer);
            if result.is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::ClosedByPeer));
    }

    #[test]
    fn test_write_from_reaches_peer() {
        let (mut transport, mut client) = socket_pair();

        let mut buffer = Buffer::new(1024, 4096);
        let data = [9u8, 8, 7];
        buffer.write_slice(data.len())[..data.len()].copy_from_slice(&data);
        buffer.move_tail(data.len());

        let count = transport.write_from(&mut buffer).unwrap();
        assert_eq!(count, 3);
        assert!(buffer.is_empty());

        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let mut received = [0u8; 3];
        client.read_exact(&mut received).unwrap();
        assert_eq!(received, data);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut transport, _client) = socket_pair();

        transport.close();
        assert!(transport.is_closed());
        transport.close();

        let mut buffer = Buffer::new(1024, 4096);
        assert_eq!(
            transport.read_into(&mut buffer).unwrap_err(),
            NetworkError::Fatal(ErrorType::ClosedByPeer)
        );
    }
}
