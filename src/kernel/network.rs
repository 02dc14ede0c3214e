//! Emulated sockets
//!
//! AF_INET sockets as pure state machines. Nothing leaves the emulator:
//! a connect succeeds only against a listening socket of the same
//! emulator on a loopback address, and data moves directly between the
//! two endpoints' receive queues.
//!
//! Stream lifecycle:
//! - client: Closed -> Connecting -> Connected -> Closing (peer closed)
//! - server: Closed -> Listen; each connect queues a Connected server-side
//!   socket in the backlog, which `accept` hands out.

use super::abi::socket::{AF_INET, SOCK_DGRAM, SOCK_STREAM, SOCKADDR_IN_LEN};
use super::errno::{Errno, SyscallResult};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};

/// First port handed out for implicit binds
const EPHEMERAL_PORT_START: u16 = 49152;

/// Receive queue bound per socket (64KB)
pub const RECV_BUFFER_SIZE: usize = 65536;

/// Socket identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SocketId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SocketType {
    /// Connection-oriented stream (like TCP)
    Stream,
    /// Connectionless datagram (like UDP)
    Datagram,
}

impl SocketType {
    /// Decode SOCK_STREAM / SOCK_DGRAM, ignoring SOCK_NONBLOCK-style flags
    pub fn from_num(n: u32) -> Option<Self> {
        match n & 0xf {
            SOCK_STREAM => Some(SocketType::Stream),
            SOCK_DGRAM => Some(SocketType::Datagram),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SocketState {
    Closed,
    Listen,
    Connecting,
    Connected,
    /// Peer has closed; queued data can still be drained
    Closing,
}

/// An emulated socket
#[derive(Debug, Clone)]
pub struct NetworkSocket {
    pub id: SocketId,
    pub family: u32,
    pub socket_type: SocketType,
    pub protocol: u32,
    pub local: Option<SocketAddrV4>,
    pub remote: Option<SocketAddrV4>,
    pub state: SocketState,
    recv_queue: VecDeque<u8>,
    /// Connected server-side sockets waiting for accept
    backlog: VecDeque<SocketId>,
    backlog_limit: usize,
    peer: Option<SocketId>,
}

impl NetworkSocket {
    fn new(id: SocketId, family: u32, socket_type: SocketType, protocol: u32) -> Self {
        Self {
            id,
            family,
            socket_type,
            protocol,
            local: None,
            remote: None,
            state: SocketState::Closed,
            recv_queue: VecDeque::new(),
            backlog: VecDeque::new(),
            backlog_limit: 0,
            peer: None,
        }
    }

    pub fn pending_bytes(&self) -> usize {
        self.recv_queue.len()
    }

    pub fn pending_connections(&self) -> usize {
        self.backlog.len()
    }

    pub fn peer(&self) -> Option<SocketId> {
        self.peer
    }
}

/// Decode a `struct sockaddr_in`
pub fn parse_sockaddr_in(bytes: &[u8]) -> SyscallResult<SocketAddrV4> {
    if bytes.len() < SOCKADDR_IN_LEN {
        return Err(Errno::EINVAL);
    }
    let family = u16::from_le_bytes([bytes[0], bytes[1]]) as u32;
    if family != AF_INET {
        return Err(Errno::EAFNOSUPPORT);
    }
    let port = u16::from_be_bytes([bytes[2], bytes[3]]);
    let ip = Ipv4Addr::new(bytes[4], bytes[5], bytes[6], bytes[7]);
    Ok(SocketAddrV4::new(ip, port))
}

/// Encode a `struct sockaddr_in`
pub fn encode_sockaddr_in(addr: &SocketAddrV4) -> [u8; SOCKADDR_IN_LEN] {
    let mut out = [0u8; SOCKADDR_IN_LEN];
    out[0..2].copy_from_slice(&(AF_INET as u16).to_le_bytes());
    out[2..4].copy_from_slice(&addr.port().to_be_bytes());
    out[4..8].copy_from_slice(&addr.ip().octets());
    out
}

/// All sockets in the emulator
#[derive(Debug, Default)]
pub struct NetworkStack {
    sockets: HashMap<SocketId, NetworkSocket>,
    /// Bound ports
    ports: HashMap<u16, SocketId>,
    next_id: u32,
    next_port: u16,
}

impl NetworkStack {
    pub fn new() -> Self {
        Self {
            sockets: HashMap::new(),
            ports: HashMap::new(),
            next_id: 1,
            next_port: EPHEMERAL_PORT_START,
        }
    }

    pub fn get(&self, id: SocketId) -> Option<&NetworkSocket> {
        self.sockets.get(&id)
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    fn socket_mut(&mut self, id: SocketId) -> SyscallResult<&mut NetworkSocket> {
        self.sockets.get_mut(&id).ok_or(Errno::EBADF)
    }

    fn alloc_id(&mut self) -> SocketId {
        let id = SocketId(self.next_id);
        self.next_id += 1;
        id
    }

    fn ephemeral_port(&mut self) -> SyscallResult<u16> {
        for _ in EPHEMERAL_PORT_START..=u16::MAX {
            let port = self.next_port;
            self.next_port = if port == u16::MAX {
                EPHEMERAL_PORT_START
            } else {
                port + 1
            };
            if !self.ports.contains_key(&port) {
                return Ok(port);
            }
        }
        Err(Errno::EADDRINUSE)
    }

    /// Create a socket
    pub fn socket(&mut self, family: u32, ty: u32, protocol: u32) -> SyscallResult<SocketId> {
        if family != AF_INET {
            return Err(Errno::EAFNOSUPPORT);
        }
        let socket_type = SocketType::from_num(ty).ok_or(Errno::EPROTONOSUPPORT)?;
        let id = self.alloc_id();
        self.sockets
            .insert(id, NetworkSocket::new(id, family, socket_type, protocol));
        Ok(id)
    }

    /// Bind to an address; port 0 picks an ephemeral port
    pub fn bind(&mut self, id: SocketId, addr: SocketAddrV4) -> SyscallResult<()> {
        if self.socket_mut(id)?.local.is_some() {
            return Err(Errno::EINVAL);
        }
        let port = if addr.port() == 0 {
            self.ephemeral_port()?
        } else if self.ports.contains_key(&addr.port()) {
            return Err(Errno::EADDRINUSE);
        } else {
            addr.port()
        };
        self.ports.insert(port, id);
        self.socket_mut(id)?.local = Some(SocketAddrV4::new(*addr.ip(), port));
        Ok(())
    }

    /// Start listening; an unbound socket gets an ephemeral port
    pub fn listen(&mut self, id: SocketId, backlog: usize) -> SyscallResult<()> {
        let socket = self.socket_mut(id)?;
        if socket.socket_type != SocketType::Stream {
            return Err(Errno::EOPNOTSUPP);
        }
        match socket.state {
            SocketState::Closed | SocketState::Listen => {}
            _ => return Err(Errno::EINVAL),
        }
        if socket.local.is_none() {
            self.bind(id, SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
        }
        let socket = self.socket_mut(id)?;
        socket.state = SocketState::Listen;
        socket.backlog_limit = backlog.max(1);
        Ok(())
    }

    /// Connect to a listening loopback socket
    ///
    /// The server side of the connection is created immediately and queued
    /// on the listener; data sent before `accept` waits in its queue.
    pub fn connect(&mut self, id: SocketId, addr: SocketAddrV4) -> SyscallResult<()> {
        let client = self.socket_mut(id)?;
        if client.socket_type != SocketType::Stream {
            return Err(Errno::EOPNOTSUPP);
        }
        match client.state {
            SocketState::Closed => {}
            SocketState::Connected | SocketState::Connecting | SocketState::Closing => {
                return Err(Errno::EISCONN);
            }
            SocketState::Listen => return Err(Errno::EINVAL),
        }

        let listener_id = self
            .ports
            .get(&addr.port())
            .copied()
            .filter(|_| addr.ip().is_loopback() || addr.ip().is_unspecified())
            .ok_or(Errno::ECONNREFUSED)?;
        let listener = self.sockets.get(&listener_id).ok_or(Errno::ECONNREFUSED)?;
        if listener.state != SocketState::Listen || listener.backlog.len() >= listener.backlog_limit {
            return Err(Errno::ECONNREFUSED);
        }
        let listener_local = listener.local;

        if self.socket_mut(id)?.local.is_none() {
            self.bind(id, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))?;
        }
        let client = self.socket_mut(id)?;
        client.state = SocketState::Connecting;
        client.remote = Some(addr);
        let client_local = client.local;

        let server_id = self.alloc_id();
        let mut server = NetworkSocket::new(server_id, AF_INET, SocketType::Stream, 0);
        server.state = SocketState::Connected;
        server.local = listener_local;
        server.remote = client_local;
        server.peer = Some(id);
        self.sockets.insert(server_id, server);

        self.socket_mut(listener_id)?.backlog.push_back(server_id);

        let client = self.socket_mut(id)?;
        client.peer = Some(server_id);
        client.state = SocketState::Connected;
        Ok(())
    }

    /// Pop the next queued connection; EAGAIN if none
    pub fn accept(&mut self, id: SocketId) -> SyscallResult<(SocketId, Option<SocketAddrV4>)> {
        let listener = self.socket_mut(id)?;
        if listener.state != SocketState::Listen {
            return Err(Errno::EINVAL);
        }
        let server_id = listener.backlog.pop_front().ok_or(Errno::EAGAIN)?;
        let remote = self.sockets.get(&server_id).and_then(|s| s.remote);
        Ok((server_id, remote))
    }

    /// Append bytes to the peer's receive queue
    pub fn send(&mut self, id: SocketId, data: &[u8]) -> SyscallResult<usize> {
        let socket = self.socket_mut(id)?;
        if socket.socket_type == SocketType::Datagram && socket.peer.is_none() {
            return Err(Errno::EDESTADDRREQ);
        }
        let peer_id = match socket.state {
            SocketState::Connected => socket.peer.ok_or(Errno::ENOTCONN)?,
            SocketState::Closing => return Err(Errno::EPIPE),
            _ => return Err(Errno::ENOTCONN),
        };
        let peer = self.sockets.get_mut(&peer_id).ok_or(Errno::EPIPE)?;
        let room = RECV_BUFFER_SIZE.saturating_sub(peer.recv_queue.len());
        if room == 0 {
            return Err(Errno::EAGAIN);
        }
        let n = data.len().min(room);
        peer.recv_queue.extend(&data[..n]);
        Ok(n)
    }

    /// Drain bytes from the receive queue
    ///
    /// An empty queue is EAGAIN while the peer is connected and 0 (EOF)
    /// once it has closed.
    pub fn recv(&mut self, id: SocketId, buf: &mut [u8]) -> SyscallResult<usize> {
        let socket = self.socket_mut(id)?;
        match socket.state {
            SocketState::Connected | SocketState::Closing => {}
            _ => return Err(Errno::ENOTCONN),
        }
        if socket.recv_queue.is_empty() {
            return if socket.state == SocketState::Closing || buf.is_empty() {
                Ok(0)
            } else {
                Err(Errno::EAGAIN)
            };
        }
        let n = buf.len().min(socket.recv_queue.len());
        for (dst, src) in buf.iter_mut().zip(socket.recv_queue.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    /// Destroy a socket, notifying its peer and tearing down unaccepted
    /// connections if it was a listener
    pub fn close(&mut self, id: SocketId) {
        let Some(socket) = self.sockets.remove(&id) else {
            return;
        };
        if let Some(local) = socket.local {
            if self.ports.get(&local.port()) == Some(&id) {
                self.ports.remove(&local.port());
            }
        }
        if let Some(peer) = socket.peer.and_then(|p| self.sockets.get_mut(&p)) {
            peer.peer = None;
            peer.state = SocketState::Closing;
        }
        for pending in socket.backlog {
            self.close(pending);
        }
    }
}
