use core::hash::Hash;

use ahash::AHashMap;

/// Answer to a request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Grant {
    /// Granted; the client now holds this amount.
    Ack(f64),
    /// Refused; the client keeps what it held before.
    Nack(f64),
}

impl Grant {
    #[must_use]
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack(_))
    }
}

/// Quota accounting, keyed by peer and client id.
#[derive(Debug, Clone)]
pub struct QuotaPool<P> {
    available: f64,
    held: AHashMap<(P, String), f64>,
}

impl<P: Eq + Hash + Clone> QuotaPool<P> {
    #[must_use]
    pub fn new(capacity: f64) -> Self {
        Self {
            available: capacity,
            held: AHashMap::new(),
        }
    }

    /// Ask for `amount`, replacing what `(peer, client)` held so far.
    /// Negative or non-finite amounts are refused.
    pub fn need(&mut self, peer: &P, client: &str, amount: f64) -> Grant {
        let held = self
            .held
            .entry((peer.clone(), client.to_owned()))
            .or_insert(0.0);
        if !amount.is_finite() || amount < 0.0 || amount > self.available + *held {
            return Grant::Nack(*held);
        }
        self.available -= amount - *held;
        *held = amount;
        Grant::Ack(amount)
    }

    /// Return the amount of a silent client to the pool.
    pub fn reclaim(&mut self, peer: &P, client: &str) -> Option<f64> {
        let held = self.held.remove(&(peer.clone(), client.to_owned()))?;
        self.available += held;
        Some(held)
    }

    #[must_use]
    pub fn available(&self) -> f64 {
        self.available
    }

    #[must_use]
    pub fn held(&self, peer: &P, client: &str) -> f64 {
        self.held
            .get(&(peer.clone(), client.to_owned()))
            .copied()
            .unwrap_or(0.0)
    }

    #[must_use]
    pub fn clients(&self) -> usize {
        self.held.len()
    }
}
