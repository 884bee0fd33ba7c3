//! Netio: mirror parameters between processes over datagrams.
//!
//! A process publishes local parameters (`netio:[+]NAME`) on a public
//! socket bound with [`Io::bind_net`] and subscribes to parameters of other
//! processes (`unix:URI#NAME`, `udp4:URI#NAME`, `udp6:URI#NAME`) through one
//! ephemeral socket per address family. Keeping the two roles on separate
//! sockets gives a restarted subscriber a fresh address, while a publisher
//! stays reachable at a fixed one.
//!
//! Liveness: publishers send `*keepalive` and subscribers repeat
//! `*subscribe` every keepalive interval. A remote silent for `lost_after`
//! intervals is lost. A lost publisher leaves its parameters in place
//! without Present, waiting for it to return; a lost consumer is dropped.

pub(crate) mod addr;
pub(crate) mod socket;
pub mod wire;

use std::io::ErrorKind;
use std::os::fd::{AsFd, BorrowedFd};

use ahash::AHashMap;
use bitflags::bitflags;
use iopar_reactor::{TimerHandle, secs};
use tracing::{debug, info, trace, warn};

use crate::backend::Backend;
use crate::error::{IoError, Result};
use crate::event_loop::{FdTarget, TimerTarget};
use crate::registry::Io;
use crate::state::{ParamId, ParamState};

use self::addr::{Family, PeerAddr, parse_uri};
use self::socket::DgramSocket;
use self::wire::{Line, MTU, PacketBuilder, parse_packet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SocketKey(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RemoteId(u64);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct RemoteFlags: u8 {
        /// The remote consumes our published parameters.
        const SEND_TO   = 0b01;
        /// We subscribed to parameters of the remote.
        const RECV_FROM = 0b10;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    struct SockFlags: u8 {
        /// A write request waits for the next sync.
        const WAITING = 0b01;
        /// Not transmitted yet.
        const NEW     = 0b10;
    }
}

struct Remote {
    id: RemoteId,
    addr: PeerAddr,
    flags: RemoteFlags,
    params: Vec<ParamId>,
    lost: Option<TimerHandle>,
}

struct NetSocket {
    sock: DgramSocket,
    public: bool,
    remotes: Vec<Remote>,
}

impl NetSocket {
    fn remote(&self, id: RemoteId) -> Option<&Remote> {
        self.remotes.iter().find(|r| r.id == id)
    }

    fn remote_mut(&mut self, id: RemoteId) -> Option<&mut Remote> {
        self.remotes.iter_mut().find(|r| r.id == id)
    }

    fn send(&self, packets: &[String], to: &PeerAddr) {
        for packet in packets {
            if let Err(err) = self.sock.send_to(packet.as_bytes(), to) {
                debug!(target: "iopar.netio", %to, %err, "send failed");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Remote { socket: SocketKey, remote: RemoteId },
}

struct SockParam {
    name: String,
    origin: Origin,
    /// Value of the last write request to a remote parameter.
    pending: f64,
    flags: SockFlags,
}

/// Netio state of one registry.
pub(crate) struct Netio {
    pid: u32,
    sockets: Vec<Option<NetSocket>>,
    public: AHashMap<Family, SocketKey>,
    autobind: AHashMap<Family, SocketKey>,
    /// Published parameters in creation order.
    locals: Vec<ParamId>,
    params: AHashMap<ParamId, SockParam>,
    dirty: bool,
    keepalive: Option<TimerHandle>,
    next_remote: u64,
}

impl Netio {
    pub(crate) fn new(pid: u32) -> Self {
        Self {
            pid,
            sockets: Vec::new(),
            public: AHashMap::new(),
            autobind: AHashMap::new(),
            locals: Vec::new(),
            params: AHashMap::new(),
            dirty: false,
            keepalive: None,
            next_remote: 0,
        }
    }

    pub(crate) fn socket_fd(&self, key: SocketKey) -> Option<BorrowedFd<'_>> {
        self.socket(key).map(|s| s.sock.as_fd())
    }

    fn socket(&self, key: SocketKey) -> Option<&NetSocket> {
        self.sockets.get(key.0)?.as_ref()
    }

    fn socket_mut(&mut self, key: SocketKey) -> Option<&mut NetSocket> {
        self.sockets.get_mut(key.0)?.as_mut()
    }

    fn insert_socket(&mut self, socket: NetSocket) -> SocketKey {
        self.sockets.push(Some(socket));
        SocketKey(self.sockets.len() - 1)
    }

    fn sockets(&self) -> impl Iterator<Item = (SocketKey, &NetSocket)> {
        self.sockets
            .iter()
            .enumerate()
            .filter_map(|(idx, s)| s.as_ref().map(|s| (SocketKey(idx), s)))
    }

    fn add_remote(&mut self, key: SocketKey, addr: PeerAddr, flags: RemoteFlags) -> Option<RemoteId> {
        self.next_remote += 1;
        let id = RemoteId(self.next_remote);
        self.socket_mut(key)?.remotes.push(Remote {
            id,
            addr,
            flags,
            params: Vec::new(),
            lost: None,
        });
        Some(id)
    }

    fn find_local(&self, name: &str) -> Option<ParamId> {
        self.locals
            .iter()
            .copied()
            .find(|id| self.params.get(id).is_some_and(|p| p.name == name))
    }

    fn find_remote(&self, key: SocketKey, remote: RemoteId, name: &str) -> Option<ParamId> {
        self.socket(key)?
            .remote(remote)?
            .params
            .iter()
            .copied()
            .find(|id| self.params.get(id).is_some_and(|p| p.name == name))
    }

    fn remove_remote(&mut self, key: SocketKey, id: RemoteId) -> Option<Remote> {
        let socket = self.socket_mut(key)?;
        let at = socket.remotes.iter().position(|r| r.id == id)?;
        Some(socket.remotes.remove(at))
    }
}

/// Backend of every netio parameter; its state lives in [`Netio`].
struct SockBackend;

impl Backend for SockBackend {
    fn can_write(&self) -> bool {
        true
    }

    fn write(&mut self, io: &mut Io, id: ParamId, value: f64) -> Result<()> {
        io.netio_write(id, value)
    }

    fn destroy(&mut self, io: &mut Io, id: ParamId) {
        io.netio_forget(id);
    }
}

pub(crate) fn create_local(io: &mut Io, id: ParamId, body: &str) -> Result<Box<dyn Backend>> {
    let (writable, name) = match body.strip_prefix('+') {
        Some(name) => (true, name),
        None => (false, body),
    };
    if name.is_empty() || name.contains(['\n', '=', '>']) {
        return Err(IoError::construction(format!("netio:{body}"), "bad parameter name"));
    }
    if io.netio.find_local(name).is_some() {
        return Err(IoError::construction(format!("netio:{body}"), "duplicate name"));
    }
    if writable {
        io.set_state_flag(id, ParamState::WRITABLE);
    }
    io.netio.params.insert(
        id,
        SockParam {
            name: name.to_owned(),
            origin: Origin::Local,
            pending: f64::NAN,
            flags: SockFlags::NEW,
        },
    );
    io.netio.locals.push(id);
    io.netio.dirty = true;
    Ok(Box::new(SockBackend))
}

pub(crate) fn create_unix(io: &mut Io, id: ParamId, body: &str) -> Result<Box<dyn Backend>> {
    create_remote(io, id, body, Family::Unix, "unix")
}

pub(crate) fn create_udp4(io: &mut Io, id: ParamId, body: &str) -> Result<Box<dyn Backend>> {
    create_remote(io, id, body, Family::Inet, "udp4")
}

pub(crate) fn create_udp6(io: &mut Io, id: ParamId, body: &str) -> Result<Box<dyn Backend>> {
    create_remote(io, id, body, Family::Inet6, "udp6")
}

fn create_remote(
    io: &mut Io,
    id: ParamId,
    body: &str,
    family: Family,
    prefix: &str,
) -> Result<Box<dyn Backend>> {
    let spec = format!("{prefix}:{body}");
    let name = match body.split_once('#') {
        Some((_, name)) if !name.is_empty() => name,
        _ => return Err(IoError::construction(&spec, "no parameter name after `#`")),
    };
    let addr = parse_uri(body, Some(family), io.netio.pid)?;
    let socket = io.netio_autobind(family)?;

    let existing = io
        .netio
        .socket(socket)
        .and_then(|s| s.remotes.iter().find(|r| r.addr == addr))
        .map(|r| r.id);
    if let Some(remote) = existing
        && io.netio.find_remote(socket, remote, name).is_some()
    {
        return Err(IoError::construction(&spec, "duplicate name"));
    }
    let remote = match existing {
        Some(remote) => remote,
        None => {
            let remote = io
                .netio
                .add_remote(socket, addr.clone(), RemoteFlags::RECV_FROM)
                .ok_or_else(|| IoError::construction(&spec, "subscribing socket is gone"))?;
            if let Some(s) = io.netio.socket(socket)
                && let Err(err) = s.sock.send_to(b"*subscribe\n", &addr)
            {
                // The publisher may come up later; keepalives keep trying.
                info!(target: "iopar.netio", %addr, %err, "subscribe failed");
            }
            io.arm_lost(socket, remote);
            remote
        }
    };
    if let Some(r) = io.netio.socket_mut(socket).and_then(|s| s.remote_mut(remote)) {
        r.params.push(id);
    }
    io.netio.params.insert(
        id,
        SockParam {
            name: name.to_owned(),
            origin: Origin::Remote { socket, remote },
            pending: f64::NAN,
            flags: SockFlags::empty(),
        },
    );
    io.store_raw(id, 0.0);
    Ok(Box::new(SockBackend))
}

impl Io {
    /// Bind the public socket of one address family (`unix:@name`,
    /// `unix:/path`, `udp4:host:port`, `udp6:[addr]:port`). Returns the
    /// bound address.
    pub fn bind_net(&mut self, uri: &str) -> Result<String> {
        let (prefix, rest) = uri
            .split_once(':')
            .ok_or_else(|| IoError::address(uri, "no address family"))?;
        let addr = parse_uri(rest, Family::from_prefix(prefix), self.netio.pid)?;
        let family = addr.family();
        if self.netio.public.contains_key(&family) {
            return Err(IoError::address(uri, "public socket of this family already bound"));
        }
        let sock = DgramSocket::bind(&addr).map_err(|err| IoError::address(uri, err.to_string()))?;
        let local = sock.local_addr().unwrap_or(addr);
        let key = self.netio.insert_socket(NetSocket {
            sock,
            public: true,
            remotes: Vec::new(),
        });
        self.netio.public.insert(family, key);
        self.watch_fd(FdTarget::Socket(key));
        self.ensure_keepalive();
        info!(target: "iopar.netio", addr = %local, "publishing");
        Ok(local.to_string())
    }

    fn netio_autobind(&mut self, family: Family) -> Result<SocketKey> {
        if let Some(key) = self.netio.autobind.get(&family) {
            return Ok(*key);
        }
        let sock = DgramSocket::bind_ephemeral(family, self.netio.pid)?;
        if let Some(local) = sock.local_addr() {
            debug!(target: "iopar.netio", addr = %local, "subscribing socket");
        }
        let key = self.netio.insert_socket(NetSocket {
            sock,
            public: false,
            remotes: Vec::new(),
        });
        self.netio.autobind.insert(family, key);
        self.watch_fd(FdTarget::Socket(key));
        self.ensure_keepalive();
        Ok(key)
    }

    fn ensure_keepalive(&mut self) {
        if self.netio.keepalive.is_none() {
            let delay = secs(self.tuning.netio.keepalive_secs);
            self.netio.keepalive = Some(self.schedule(delay, TimerTarget::Keepalive));
        }
    }

    /// (Re)start the lost timer of a remote.
    fn arm_lost(&mut self, socket: SocketKey, remote: RemoteId) {
        let Some(mut slot) = self
            .netio
            .socket_mut(socket)
            .and_then(|s| s.remote_mut(remote))
            .map(|r| r.lost.take())
        else {
            return;
        };
        let delay = secs(self.tuning.netio.keepalive_secs * self.tuning.netio.lost_after);
        self.reschedule(&mut slot, delay, TimerTarget::RemoteLost { socket, remote });
        if let Some(r) = self.netio.socket_mut(socket).and_then(|s| s.remote_mut(remote)) {
            r.lost = slot;
        }
    }

    pub(crate) fn netio_keepalive(&mut self) {
        for (_, socket) in self.netio.sockets() {
            let message = if socket.public { "*keepalive\n" } else { "*subscribe\n" };
            for remote in &socket.remotes {
                if let Err(err) = socket.sock.send_to(message.as_bytes(), &remote.addr) {
                    trace!(target: "iopar.netio", to = %remote.addr, %err, "keepalive not delivered");
                }
            }
        }
        let delay = secs(self.tuning.netio.keepalive_secs);
        self.netio.keepalive = Some(self.schedule_repeat(delay, TimerTarget::Keepalive));
    }

    pub(crate) fn netio_remote_lost(&mut self, socket: SocketKey, remote: RemoteId) {
        let Some(r) = self.netio.socket_mut(socket).and_then(|s| s.remote_mut(remote)) else {
            return;
        };
        r.lost = None;
        if r.flags.contains(RemoteFlags::RECV_FROM) {
            // Keep subscribing, the publisher may come back.
            let params = r.params.clone();
            info!(target: "iopar.netio", remote = %r.addr, "publisher lost");
            for id in params {
                self.clear_present(id);
            }
        } else if let Some(gone) = self.netio.remove_remote(socket, remote) {
            debug!(target: "iopar.netio", remote = %gone.addr, "consumer dropped");
        }
    }

    pub(crate) fn netio_readable(&mut self, key: SocketKey) {
        let mut buf = vec![0u8; MTU];
        loop {
            let received = match self.netio.socket(key) {
                Some(socket) => socket.sock.recv_from(&mut buf),
                None => return,
            };
            match received {
                Ok((len, Some(from))) => {
                    let text = String::from_utf8_lossy(&buf[..len]).into_owned();
                    self.netio_packet(key, from, &text);
                }
                Ok((_, None)) => {
                    debug!(target: "iopar.netio", "datagram from an unnamed socket ignored");
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(target: "iopar.netio", %err, "receive failed");
                    return;
                }
            }
        }
    }

    fn netio_packet(&mut self, key: SocketKey, from: PeerAddr, text: &str) {
        let Some(socket) = self.netio.socket(key) else {
            return;
        };
        let public = socket.public;
        let known = socket.remotes.iter().find(|r| r.addr == from).map(|r| r.id);
        let remote = match known {
            Some(remote) => remote,
            None if public => match self.netio.add_remote(key, from.clone(), RemoteFlags::empty()) {
                Some(remote) => remote,
                None => return,
            },
            None => {
                debug!(target: "iopar.netio", %from, "packet from unknown peer ignored");
                return;
            }
        };
        self.arm_lost(key, remote);
        let before = self
            .netio
            .socket(key)
            .and_then(|s| s.remote(remote))
            .map_or(RemoteFlags::empty(), |r| r.flags);

        for line in parse_packet(text) {
            trace!(target: "iopar.netio", %from, ?line, "received");
            match line {
                Line::Keepalive | Line::Initial => {}
                Line::Subscribe if !public => {
                    info!(target: "iopar.netio", %from, "subscribe on a subscribing socket ignored");
                }
                Line::Subscribe => {
                    if let Some(r) = self.netio.socket_mut(key).and_then(|s| s.remote_mut(remote)) {
                        r.flags.insert(RemoteFlags::SEND_TO);
                    }
                }
                Line::Assign { name, .. } if public => {
                    info!(target: "iopar.netio", %from, name, "assignment on a publishing socket ignored");
                }
                Line::Assign { name, value } => self.netio_assign(key, remote, name, value),
                Line::Write { name, .. } if !public => {
                    info!(target: "iopar.netio", %from, name, "write request on a subscribing socket ignored");
                }
                Line::Write { name, value } => self.netio_remote_write(&from, name, value),
                Line::Other(line) => {
                    debug!(target: "iopar.netio", %from, line, "unknown line");
                }
            }
        }

        let after = self
            .netio
            .socket(key)
            .and_then(|s| s.remote(remote))
            .map_or(RemoteFlags::empty(), |r| r.flags);
        if !before.contains(RemoteFlags::SEND_TO) && after.contains(RemoteFlags::SEND_TO) {
            self.netio_snapshot(key, &from);
        }
    }

    /// A publisher sent a value.
    fn netio_assign(&mut self, key: SocketKey, remote: RemoteId, name: &str, value: f64) {
        if let Some(id) = self.netio.find_remote(key, remote, name) {
            self.store(id, value);
            self.set_present(id);
        }
    }

    /// A consumer asked to change one of our parameters.
    fn netio_remote_write(&mut self, from: &PeerAddr, name: &str, value: f64) {
        let Some(id) = self.netio.find_local(name) else {
            debug!(target: "iopar.netio", %from, name, "write to unknown parameter");
            return;
        };
        if !self.has_state(id, ParamState::WRITABLE) {
            info!(target: "iopar.netio", %from, name, "remote write refused, read-only");
            return;
        }
        self.store_raw(id, value);
        self.mark_dirty(id);
        self.set_present(id);
        self.netio.dirty = true;
    }

    /// Send every published value to a new consumer.
    fn netio_snapshot(&mut self, key: SocketKey, to: &PeerAddr) {
        let mut builder = PacketBuilder::new();
        builder.line("*initial");
        for id in &self.netio.locals {
            if let Some(param) = self.netio.params.get(id) {
                builder.assign(&param.name, self.value(*id));
            }
        }
        let packets = builder.finish();
        if let Some(socket) = self.netio.socket(key) {
            debug!(target: "iopar.netio", %to, "new consumer, sending snapshot");
            socket.send(&packets, to);
        }
    }

    fn netio_write(&mut self, id: ParamId, value: f64) -> Result<()> {
        let param = self.netio.params.get_mut(&id).ok_or(IoError::NoDevice(id))?;
        match param.origin {
            Origin::Local => {
                self.store_raw(id, value);
                self.set_present(id);
            }
            Origin::Remote { .. } => {
                param.pending = value;
                param.flags.insert(SockFlags::WAITING);
            }
        }
        self.netio.dirty = true;
        Ok(())
    }

    fn netio_forget(&mut self, id: ParamId) {
        let Some(param) = self.netio.params.remove(&id) else {
            return;
        };
        match param.origin {
            Origin::Local => self.netio.locals.retain(|p| *p != id),
            Origin::Remote { socket, remote } => {
                let Some(r) = self.netio.socket_mut(socket).and_then(|s| s.remote_mut(remote)) else {
                    return;
                };
                r.params.retain(|p| *p != id);
                if r.params.is_empty()
                    && let Some(gone) = self.netio.remove_remote(socket, remote)
                {
                    self.cancel_timer(gone.lost);
                    debug!(target: "iopar.netio", remote = %gone.addr, "last parameter gone, unsubscribed");
                }
            }
        }
    }

    /// Transmit pending changes: dirty or new published values to every
    /// consumer, write requests to the publishers.
    pub(crate) fn netio_sync(&mut self) {
        if !self.netio.dirty {
            return;
        }
        self.netio.dirty = false;

        let mut updates = PacketBuilder::new();
        for id in &self.netio.locals {
            let Some(param) = self.netio.params.get(id) else {
                continue;
            };
            if param.flags.contains(SockFlags::NEW) || self.has_state(*id, ParamState::DIRTY) {
                updates.assign(&param.name, self.value(*id));
            }
        }
        for id in &self.netio.locals {
            if let Some(param) = self.netio.params.get_mut(id) {
                param.flags.remove(SockFlags::NEW);
            }
        }
        let updates = updates.finish();

        for (_, socket) in self.netio.sockets() {
            if socket.public {
                if updates.is_empty() {
                    continue;
                }
                for remote in &socket.remotes {
                    if remote.flags.contains(RemoteFlags::SEND_TO) {
                        socket.send(&updates, &remote.addr);
                    }
                }
                continue;
            }
            for remote in &socket.remotes {
                let mut writes = PacketBuilder::new();
                for id in &remote.params {
                    if let Some(param) = self.netio.params.get(id)
                        && param.flags.contains(SockFlags::WAITING)
                    {
                        writes.write(&param.name, param.pending);
                    }
                }
                if !writes.is_empty() {
                    socket.send(&writes.finish(), &remote.addr);
                }
            }
        }
        for param in self.netio.params.values_mut() {
            param.flags.remove(SockFlags::WAITING);
        }
    }
}
