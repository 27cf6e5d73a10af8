//! Deribit subscription channel names.
//!
//! Channel strings are dot-separated. Instrument names never contain a dot,
//! but `user.*` scopes may (`future.BTC`, `any.any`), so parsing anchors on
//! the first and last segments.

use std::fmt;
use std::str::FromStr;

use crate::error::GatewayError;

/// Notification interval suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interval {
    Raw,
    Ms100,
    Agg2,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Raw => "raw",
            Interval::Ms100 => "100ms",
            Interval::Agg2 => "agg2",
        }
    }
}

impl FromStr for Interval {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Interval::Raw),
            "100ms" => Ok(Interval::Ms100),
            "agg2" => Ok(Interval::Agg2),
            other => Err(GatewayError::Protocol(format!("unknown interval: {}", other))),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subscribable upstream channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Grouped book snapshot: `book.{instrument}.{group}.{depth}.{interval}`.
    /// Every notification carries the full top-of-book, never a delta.
    Book {
        instrument: String,
        group: String,
        depth: u32,
        interval: Interval,
    },
    /// `trades.{instrument}.{interval}`
    Trades { instrument: String, interval: Interval },
    /// `ticker.{instrument}.{interval}`
    Ticker { instrument: String, interval: Interval },
    /// `user.orders.{scope}.{interval}`
    UserOrders { scope: String, interval: Interval },
    /// `user.changes.{scope}.{interval}`
    UserChanges { scope: String, interval: Interval },
}

impl Channel {
    pub fn book(instrument: impl Into<String>, depth: u32, interval: Interval) -> Self {
        Channel::Book {
            instrument: instrument.into(),
            group: "none".to_string(),
            depth,
            interval,
        }
    }

    pub fn trades(instrument: impl Into<String>, interval: Interval) -> Self {
        Channel::Trades {
            instrument: instrument.into(),
            interval,
        }
    }

    pub fn ticker(instrument: impl Into<String>, interval: Interval) -> Self {
        Channel::Ticker {
            instrument: instrument.into(),
            interval,
        }
    }

    /// All orders on the account.
    pub fn user_orders() -> Self {
        Channel::UserOrders {
            scope: "any.any".to_string(),
            interval: Interval::Raw,
        }
    }

    /// All orders, positions and fills on the account.
    pub fn user_changes() -> Self {
        Channel::UserChanges {
            scope: "any.any".to_string(),
            interval: Interval::Raw,
        }
    }

    /// Requires an authenticated session.
    pub fn is_private(&self) -> bool {
        matches!(self, Channel::UserOrders { .. } | Channel::UserChanges { .. })
    }

    pub fn subscribe_method(&self) -> &'static str {
        if self.is_private() {
            "private/subscribe"
        } else {
            "public/subscribe"
        }
    }

    pub fn unsubscribe_method(&self) -> &'static str {
        if self.is_private() {
            "private/unsubscribe"
        } else {
            "public/unsubscribe"
        }
    }

    pub fn instrument(&self) -> Option<&str> {
        match self {
            Channel::Book { instrument, .. }
            | Channel::Trades { instrument, .. }
            | Channel::Ticker { instrument, .. } => Some(instrument),
            Channel::UserOrders { .. } | Channel::UserChanges { .. } => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Book {
                instrument,
                group,
                depth,
                interval,
            } => write!(f, "book.{}.{}.{}.{}", instrument, group, depth, interval),
            Channel::Trades { instrument, interval } => write!(f, "trades.{}.{}", instrument, interval),
            Channel::Ticker { instrument, interval } => write!(f, "ticker.{}.{}", instrument, interval),
            Channel::UserOrders { scope, interval } => write!(f, "user.orders.{}.{}", scope, interval),
            Channel::UserChanges { scope, interval } => write!(f, "user.changes.{}.{}", scope, interval),
        }
    }
}

impl FromStr for Channel {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        let invalid = || GatewayError::Protocol(format!("unsupported channel: {}", s));

        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid());
        }

        match parts.as_slice() {
            ["book", instrument, group, depth, interval] => Ok(Channel::Book {
                instrument: instrument.to_string(),
                group: group.to_string(),
                depth: depth.parse().map_err(|_| invalid())?,
                interval: interval.parse()?,
            }),
            ["trades", instrument, interval] => Ok(Channel::Trades {
                instrument: instrument.to_string(),
                interval: interval.parse()?,
            }),
            ["ticker", instrument, interval] => Ok(Channel::Ticker {
                instrument: instrument.to_string(),
                interval: interval.parse()?,
            }),
            ["user", kind @ ("orders" | "changes"), scope @ .., interval] if matches!(scope.len(), 1 | 2) => {
                let scope = scope.join(".");
                let interval = interval.parse()?;
                Ok(if *kind == "orders" {
                    Channel::UserOrders { scope, interval }
                } else {
                    Channel::UserChanges { scope, interval }
                })
            }
            _ => Err(invalid()),
        }
    }
}
