use core::time::Duration;
use std::io::{self, ErrorKind};
use std::os::fd::AsFd;
use std::time::Instant;

use iopar_reactor::wait_readable;
use tracing::{debug, warn};

use crate::error::Result;
use crate::netio::addr::{PeerAddr, UnixName};
use crate::netio::socket::DgramSocket;
use crate::quota::server::quota_addr;
use crate::quota::{Grant, Need};

/// Talks to a quota daemon. The socket is bound on first use.
pub struct QuotaClient {
    sock: Option<DgramSocket>,
    timeout: Duration,
}

impl Default for QuotaClient {
    fn default() -> Self {
        Self::new()
    }
}

fn client_name(pid: u32, attempt: u32) -> PeerAddr {
    let name = if attempt == 0 {
        format!("libio-rclient-{pid}")
    } else {
        format!("libio-rclient-{pid}-{attempt}")
    };
    PeerAddr::Unix(UnixName::Abstract(name.into_bytes()))
}

impl QuotaClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sock: None,
            timeout: Duration::from_secs(1),
        }
    }

    /// Give up on an answer after `timeout`.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn socket(&mut self) -> io::Result<&DgramSocket> {
        if self.sock.is_none() {
            let pid = std::process::id();
            let mut attempt = 0;
            let sock = loop {
                match DgramSocket::bind(&client_name(pid, attempt)) {
                    Err(err) if err.kind() == ErrorKind::AddrInUse && attempt < 64 => attempt += 1,
                    other => break other?,
                }
            };
            self.sock = Some(sock);
        }
        self.sock
            .as_ref()
            .ok_or_else(|| io::Error::from(ErrorKind::NotConnected))
    }

    /// Ask the daemon at `uri` for `amount` on behalf of `cid`.
    ///
    /// Returns whether the amount was granted. An empty `uri` means no
    /// daemon is configured and always grants.
    pub fn take(&mut self, uri: &str, cid: &str, amount: f64) -> Result<bool> {
        if uri.is_empty() {
            return Ok(true);
        }
        let to = quota_addr(uri)?;
        let timeout = self.timeout;
        let sock = self.socket()?;

        let mut buf = [0u8; 1024];
        // Late answers to an earlier request.
        while sock.recv_from(&mut buf).is_ok() {}

        let request = Need { client: cid, amount }.encode();
        if let Err(err) = sock.send_to(request.as_bytes(), &to) {
            warn!(target: "iopar.quota", %to, %err, "cannot send request");
            return Err(err.into());
        }

        let give_up = Instant::now() + timeout;
        loop {
            let left = give_up.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(io::Error::new(ErrorKind::TimedOut, "no answer from quota daemon").into());
            }
            if wait_readable(&[sock.as_fd()], Some(left))?.is_empty() {
                continue;
            }
            match sock.recv_from(&mut buf) {
                Ok((len, from)) => {
                    if from.as_ref() != Some(&to) {
                        continue;
                    }
                    let text = String::from_utf8_lossy(&buf[..len]);
                    match Grant::parse(&text) {
                        Some(grant) => {
                            debug!(target: "iopar.quota", cid, amount, ?grant, "answer");
                            return Ok(grant.is_ack());
                        }
                        None => return Ok(false),
                    }
                }
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota::QuotaServer;
    use crate::tuning::QuotaTuning;

    #[test]
    fn empty_uri_always_grants() {
        let mut client = QuotaClient::new();
        assert!(client.take("", "x", 100.0).unwrap());
        assert!(client.sock.is_none());
    }

    #[test]
    fn silent_daemon_times_out() {
        let uri = format!("@iopar-quota-silent-{}", std::process::id());
        let _mute = DgramSocket::bind(&quota_addr(&uri).unwrap()).unwrap();
        let mut client = QuotaClient::new().with_timeout(Duration::from_millis(20));
        assert!(client.take(&uri, "x", 1.0).is_err());
    }

    #[test]
    fn takes_from_a_daemon_thread() {
        let uri = format!("@iopar-quota-thread-{}", std::process::id());
        let server_uri = uri.clone();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let daemon = std::thread::spawn(move || {
            let mut server = QuotaServer::bind(&server_uri, 1.0, &QuotaTuning::default()).unwrap();
            ready_tx.send(()).unwrap();
            for _ in 0..2 {
                server.poll_once(Some(Duration::from_secs(2))).unwrap();
            }
        });
        ready_rx.recv().unwrap();

        let mut client = QuotaClient::new();
        assert!(client.take(&uri, "heater", 0.75).unwrap());
        assert!(!client.take(&uri, "oven", 0.5).unwrap());
        daemon.join().unwrap();
    }
}
