//! Non-blocking datagram sockets for the Unix and UDP families.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::{self, UnixDatagram};

use nix::sys::stat::{Mode, umask};

use crate::netio::addr::{Family, PeerAddr, UnixName};

pub(crate) enum DgramSocket {
    Unix(UnixDatagram),
    Udp(UdpSocket),
}

#[cfg(target_os = "linux")]
fn abstract_addr(name: &[u8]) -> io::Result<net::SocketAddr> {
    use std::os::linux::net::SocketAddrExt;
    net::SocketAddr::from_abstract_name(name)
}

#[cfg(not(target_os = "linux"))]
fn abstract_addr(_name: &[u8]) -> io::Result<net::SocketAddr> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract Unix names need Linux",
    ))
}

fn unix_addr(name: &UnixName) -> io::Result<net::SocketAddr> {
    match name {
        UnixName::Path(path) => net::SocketAddr::from_pathname(path),
        UnixName::Abstract(name) => abstract_addr(name),
    }
}

#[cfg(target_os = "linux")]
fn peer_of(addr: &net::SocketAddr) -> Option<PeerAddr> {
    use std::os::linux::net::SocketAddrExt;
    if let Some(name) = addr.as_abstract_name() {
        return Some(PeerAddr::Unix(UnixName::Abstract(name.to_vec())));
    }
    addr.as_pathname()
        .map(|path| PeerAddr::Unix(UnixName::Path(path.to_path_buf())))
}

#[cfg(not(target_os = "linux"))]
fn peer_of(addr: &net::SocketAddr) -> Option<PeerAddr> {
    addr.as_pathname()
        .map(|path| PeerAddr::Unix(UnixName::Path(path.to_path_buf())))
}

impl DgramSocket {
    /// Bind to `addr`. Unix path sockets are created with a cleared umask
    /// so every local user may write to them.
    pub(crate) fn bind(addr: &PeerAddr) -> io::Result<Self> {
        let socket = match addr {
            PeerAddr::Unix(name) => {
                let sockaddr = unix_addr(name)?;
                let saved = umask(Mode::empty());
                let bound = UnixDatagram::bind_addr(&sockaddr);
                umask(saved);
                Self::Unix(bound?)
            }
            PeerAddr::Inet(sockaddr) => Self::Udp(UdpSocket::bind(sockaddr)?),
        };
        socket.set_nonblocking()?;
        Ok(socket)
    }

    /// Bind an ephemeral socket of `family`.
    pub(crate) fn bind_ephemeral(family: Family, pid: u32) -> io::Result<Self> {
        match family {
            Family::Unix => {
                // Several registries in one process each need their own name.
                let mut attempt = 0;
                loop {
                    match Self::bind(&PeerAddr::autobind_unix(pid, attempt)) {
                        Err(err) if err.kind() == io::ErrorKind::AddrInUse && attempt < 64 => {
                            attempt += 1;
                        }
                        other => return other,
                    }
                }
            }
            Family::Inet => Self::bind(&PeerAddr::Inet(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))),
            Family::Inet6 => Self::bind(&PeerAddr::Inet(SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)))),
        }
    }

    fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            Self::Unix(sock) => sock.set_nonblocking(true),
            Self::Udp(sock) => sock.set_nonblocking(true),
        }
    }

    pub(crate) fn send_to(&self, buf: &[u8], to: &PeerAddr) -> io::Result<usize> {
        match (self, to) {
            (Self::Unix(sock), PeerAddr::Unix(name)) => sock.send_to_addr(buf, &unix_addr(name)?),
            (Self::Udp(sock), PeerAddr::Inet(addr)) => sock.send_to(buf, addr),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "address family does not match the socket",
            )),
        }
    }

    /// Receive one datagram. The sender is `None` when it has no address
    /// we could answer to (an unbound Unix socket).
    pub(crate) fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, Option<PeerAddr>)> {
        match self {
            Self::Unix(sock) => {
                let (len, from) = sock.recv_from(buf)?;
                Ok((len, peer_of(&from)))
            }
            Self::Udp(sock) => {
                let (len, from) = sock.recv_from(buf)?;
                Ok((len, Some(PeerAddr::Inet(from))))
            }
        }
    }

    pub(crate) fn local_addr(&self) -> Option<PeerAddr> {
        match self {
            Self::Unix(sock) => sock.local_addr().ok().as_ref().and_then(peer_of),
            Self::Udp(sock) => sock.local_addr().ok().map(PeerAddr::Inet),
        }
    }
}

impl AsFd for DgramSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Unix(sock) => sock.as_fd(),
            Self::Udp(sock) => sock.as_fd(),
        }
    }
}
