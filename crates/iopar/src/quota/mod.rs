//! System-wide resource quota over Unix datagrams.
//!
//! Clients ask a daemon for an amount of a shared resource and repeat the
//! request while they need it. A client that stays silent longer than the
//! reclaim timeout gives its amount back.
//!
//! ```text
//! client -> daemon   *need <id> <amount>
//! daemon -> client   *ack <amount>      granted
//! daemon -> client   *nack <amount>     refused, amount still held
//! ```

mod client;
mod pool;
mod server;

pub use client::QuotaClient;
pub use pool::{Grant, QuotaPool};
pub use server::QuotaServer;

use crate::netio::wire::format_value;
use crate::spec::leading_f64;

/// A `*need` request.
#[derive(Debug, Clone, PartialEq)]
pub struct Need<'a> {
    pub client: &'a str,
    pub amount: f64,
}

impl<'a> Need<'a> {
    /// Parse `*need ID AMOUNT`. A missing or garbled amount reads as 0.
    #[must_use]
    pub fn parse(text: &'a str) -> Option<Self> {
        let mut words = text.split_ascii_whitespace();
        if words.next()? != "*need" {
            return None;
        }
        let client = words.next()?;
        let amount = words
            .next()
            .and_then(leading_f64)
            .map_or(0.0, |(value, _)| value);
        Some(Self { client, amount })
    }

    #[must_use]
    pub fn encode(&self) -> String {
        format!("*need {} {}", self.client, format_value(self.amount))
    }
}

impl Grant {
    #[must_use]
    pub fn encode(&self) -> String {
        match self {
            Self::Ack(amount) => format!("*ack {}", format_value(*amount)),
            Self::Nack(amount) => format!("*nack {}", format_value(*amount)),
        }
    }

    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let mut words = text.split_ascii_whitespace();
        let verb = words.next()?;
        let amount = words
            .next()
            .and_then(leading_f64)
            .map_or(f64::NAN, |(value, _)| value);
        match verb {
            "*ack" => Some(Self::Ack(amount)),
            "*nack" => Some(Self::Nack(amount)),
            _ => None,
        }
    }
}
