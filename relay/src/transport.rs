//! Socket transport: one UDP socket, polled with a one-second timeout, with small scratch
//! buffers for the datagram currently being received or staged for send.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::Duration;

use mio::net::UdpSocket;
use mio::{Events, Poll, PollOpt, Ready, Token};
use socket2::{Domain, Protocol, Socket, Type};

/// Large enough for any datagram this protocol sends - control replies and forwarded game
/// payloads are both well under the Ethernet MTU.
pub const NET_BUF_SIZE: usize = 2048;

const SOCKET_TOKEN: Token = Token(0);

pub struct Transport {
    socket: UdpSocket,
    poll: Poll,
    events: Events,
    in_buf: [u8; NET_BUF_SIZE],
    in_len: usize,
    out_buf: [u8; NET_BUF_SIZE],
    out_len: usize,
}

impl Transport {
    pub fn bind(addr: SocketAddrV4, broadcast: bool) -> io::Result<Transport> {
        let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        raw.set_reuse_address(true)?;
        if broadcast {
            raw.set_broadcast(true)?;
        }
        raw.bind(&addr.into())?;
        raw.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = raw.into();
        let socket = UdpSocket::from_socket(std_socket)?;

        let poll = Poll::new()?;
        poll.register(&socket, SOCKET_TOKEN, Ready::readable(), PollOpt::level())?;

        Ok(Transport {
            socket,
            poll,
            events: Events::with_capacity(16),
            in_buf: [0u8; NET_BUF_SIZE],
            in_len: 0,
            out_buf: [0u8; NET_BUF_SIZE],
            out_len: 0,
        })
    }

    /// Waits up to `timeout` for a datagram and, if one arrived, receives it into the
    /// input scratch buffer. Returns `None` on a bare timeout - not an error, just the
    /// signal for the engine to run its once-a-second housekeeping.
    pub fn recv(&mut self, timeout: Duration) -> io::Result<Option<SocketAddrV4>> {
        self.poll.poll(&mut self.events, Some(timeout))?;
        if self.events.iter().next().is_none() {
            return Ok(None);
        }

        match self.socket.recv_from(&mut self.in_buf) {
            Ok((len, addr)) => {
                self.in_len = len;
                Ok(Some(to_v4(addr)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn input(&self) -> &[u8] {
        &self.in_buf[..self.in_len]
    }

    /// Borrows the output scratch buffer for building the next outgoing datagram. The
    /// caller writes through the returned slice with a `codec::Writer` and reports how
    /// much it wrote via `stage`.
    pub fn out_buf_mut(&mut self) -> &mut [u8] {
        &mut self.out_buf
    }

    pub fn stage(&mut self, len: usize) {
        self.out_len = len;
    }

    /// Sends the staged datagram without clearing it, so it can go out to several
    /// destinations in a row (broadcast fan-out) before a single `discard`.
    pub fn send_noflush(&mut self, dst: SocketAddrV4) -> io::Result<usize> {
        self.socket.send_to(&self.out_buf[..self.out_len], &SocketAddr::V4(dst))
    }

    /// Sends the staged datagram and immediately discards it - the common single-recipient case.
    pub fn send(&mut self, dst: SocketAddrV4) -> io::Result<usize> {
        let n = self.send_noflush(dst)?;
        self.discard();
        Ok(n)
    }

    pub fn discard(&mut self) {
        self.out_len = 0;
    }
}

fn to_v4(addr: SocketAddr) -> SocketAddrV4 {
    match addr {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(_) => unreachable!("relay socket is bound to an IPv4 address"),
    }
}
