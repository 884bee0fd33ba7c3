use core::time::Duration;
use std::io::ErrorKind;
use std::os::fd::AsFd;

use ahash::AHashMap;
use iopar_reactor::{Clock, MonoClock, TimerHandle, TimerQueue, secs, wait_readable};
use tracing::{debug, info, warn};

use crate::error::{IoError, Result};
use crate::netio::addr::{Family, PeerAddr, parse_uri};
use crate::netio::socket::DgramSocket;
use crate::quota::{Need, QuotaPool};
use crate::tuning::QuotaTuning;

type ClientKey = (PeerAddr, String);

/// The quota daemon: one Unix datagram socket and a [`QuotaPool`].
pub struct QuotaServer {
    sock: DgramSocket,
    addr: PeerAddr,
    pool: QuotaPool<PeerAddr>,
    clock: Box<dyn Clock>,
    reclaim: Duration,
    timers: TimerQueue<ClientKey>,
    deadlines: AHashMap<ClientKey, TimerHandle>,
}

/// Strip an optional `unix:` prefix; quota always runs over Unix sockets.
pub(crate) fn quota_addr(uri: &str) -> Result<PeerAddr> {
    let rest = uri.strip_prefix("unix:").unwrap_or(uri);
    if rest.is_empty() {
        return Err(IoError::address(uri, "empty socket name"));
    }
    parse_uri(rest, Some(Family::Unix), std::process::id())
}

impl QuotaServer {
    /// Bind `uri` (`@name` or a path) with `capacity` to hand out.
    pub fn bind(uri: &str, capacity: f64, tuning: &QuotaTuning) -> Result<Self> {
        Self::bind_with_clock(uri, capacity, tuning, MonoClock::new())
    }

    pub fn bind_with_clock(
        uri: &str,
        capacity: f64,
        tuning: &QuotaTuning,
        clock: impl Clock + 'static,
    ) -> Result<Self> {
        let addr = quota_addr(uri)?;
        let sock = DgramSocket::bind(&addr).map_err(|err| IoError::address(uri, err.to_string()))?;
        info!(target: "iopar.quota", %addr, capacity, "serving");
        Ok(Self {
            sock,
            addr,
            pool: QuotaPool::new(capacity),
            clock: Box::new(clock),
            reclaim: secs(tuning.reclaim_secs),
            timers: TimerQueue::new(),
            deadlines: AHashMap::new(),
        })
    }

    #[must_use]
    pub fn local_addr(&self) -> String {
        self.addr.to_string()
    }

    #[must_use]
    pub fn available(&self) -> f64 {
        self.pool.available()
    }

    #[must_use]
    pub fn clients(&self) -> usize {
        self.pool.clients()
    }

    /// Wait up to `max_wait` for requests, answer them, then reclaim
    /// clients whose time ran out.
    pub fn poll_once(&mut self, max_wait: Option<Duration>) -> Result<()> {
        self.reclaim_expired();
        let mut timeout = self.timers.time_to_next(self.clock.now());
        if let Some(max) = max_wait {
            timeout = Some(timeout.map_or(max, |t| t.min(max)));
        }
        let ready = wait_readable(&[self.sock.as_fd()], timeout)?;
        if !ready.is_empty() {
            self.drain();
        }
        self.reclaim_expired();
        Ok(())
    }

    fn drain(&mut self) {
        let mut buf = [0u8; 1024];
        loop {
            match self.sock.recv_from(&mut buf) {
                Ok((len, Some(from))) => {
                    let text = String::from_utf8_lossy(&buf[..len]).into_owned();
                    self.handle(&from, &text);
                }
                Ok((_, None)) => debug!(target: "iopar.quota", "request from unnamed socket ignored"),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(target: "iopar.quota", %err, "receive failed");
                    return;
                }
            }
        }
    }

    fn handle(&mut self, from: &PeerAddr, text: &str) {
        let Some(need) = Need::parse(text) else {
            debug!(target: "iopar.quota", %from, text, "not a request");
            return;
        };
        let key = (from.clone(), need.client.to_owned());
        let deadline = self.clock.now().saturating_add(self.reclaim);
        let mut slot = self.deadlines.remove(&key);
        self.timers.reschedule(&mut slot, deadline, key.clone());
        if let Some(handle) = slot {
            self.deadlines.insert(key, handle);
        }

        let before = self.pool.held(from, need.client);
        let grant = self.pool.need(from, need.client, need.amount);
        if grant.is_ack() && before != need.amount {
            info!(
                target: "iopar.quota",
                client = need.client,
                need = need.amount,
                was = before,
                remain = self.pool.available(),
                "allocation changed"
            );
        }
        if let Err(err) = self.sock.send_to(grant.encode().as_bytes(), from) {
            warn!(target: "iopar.quota", %from, %err, "cannot answer");
        }
    }

    fn reclaim_expired(&mut self) {
        let now = self.clock.now();
        while let Some(expired) = self.timers.pop_expired(now) {
            let (peer, client) = expired.target;
            self.deadlines.remove(&(peer.clone(), client.clone()));
            if let Some(amount) = self.pool.reclaim(&peer, &client) {
                info!(
                    target: "iopar.quota",
                    client,
                    amount,
                    remain = self.pool.available(),
                    "client lost"
                );
            }
        }
    }
}
