use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use relay_gateway::{Credentials, MAINNET_REST_URL, MAINNET_WS_URL, TESTNET_REST_URL, TESTNET_WS_URL};

use crate::error::RelayError;

/// Order book depths Deribit accepts for grouped book channels.
pub const BOOK_DEPTHS: [u32; 8] = [1, 5, 10, 20, 50, 100, 1000, 10000];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// deribit-relay: Deribit market and account state → WebSocket clients
#[derive(Parser, Debug, Clone)]
#[command(name = "deribit-relay")]
pub struct Config {
    /// Deribit API client id (enables private channels and order entry)
    #[arg(long, env = "DERIBIT_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Deribit API client secret
    #[arg(long, env = "DERIBIT_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Use mainnet instead of testnet
    #[arg(long, env = "DERIBIT_MAINNET")]
    pub mainnet: bool,

    /// Downstream WebSocket listen address
    #[arg(long, env = "RELAY_LISTEN_ADDR", default_value = "0.0.0.0:9000")]
    pub listen_addr: String,

    /// Health/metrics listen address
    #[arg(long, env = "RELAY_HEALTH_ADDR", default_value = "0.0.0.0:9090")]
    pub health_addr: String,

    /// Comma-separated instruments to relay (e.g. BTC-PERPETUAL,ETH-PERPETUAL)
    #[arg(long, env = "RELAY_INSTRUMENTS", default_value = "BTC-PERPETUAL")]
    pub instruments: String,

    /// Currency used for position and open order refreshes
    #[arg(long, env = "RELAY_CURRENCY", default_value = "BTC")]
    pub currency: String,

    /// Order book depth for book channels and snapshot fetches
    #[arg(long, env = "RELAY_BOOK_DEPTH", default_value = "10")]
    pub book_depth: u32,

    /// Inbound dispatcher queue capacity
    #[arg(long, env = "RELAY_QUEUE_CAPACITY", default_value = "10000")]
    pub queue_capacity: usize,

    /// Timeout for every upstream request, in milliseconds
    #[arg(long, env = "RELAY_REQUEST_TIMEOUT_MS", default_value = "5000")]
    pub request_timeout_ms: u64,

    /// Upstream heartbeat interval in seconds (0 disables)
    #[arg(long, env = "RELAY_HEARTBEAT_SECS", default_value = "30")]
    pub heartbeat_secs: u64,

    /// Write latency metrics as CSV to this path on shutdown
    #[arg(long, env = "RELAY_METRICS_CSV")]
    pub metrics_csv: Option<PathBuf>,

    /// Stop after this many seconds instead of waiting for a signal
    #[arg(long)]
    pub run_for_secs: Option<u64>,

    /// Log output format
    #[arg(long, env = "RELAY_LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: LogFormat,
}

impl Config {
    pub fn validate(&self) -> Result<(), RelayError> {
        if !BOOK_DEPTHS.contains(&self.book_depth) {
            return Err(RelayError::Config(format!(
                "book depth {} not one of {:?}",
                self.book_depth, BOOK_DEPTHS
            )));
        }
        if self.queue_capacity == 0 {
            return Err(RelayError::Config("queue capacity must be positive".into()));
        }
        if self.request_timeout_ms == 0 {
            return Err(RelayError::Config("request timeout must be positive".into()));
        }
        if self.client_id.is_some() != self.client_secret.is_some() {
            return Err(RelayError::Config(
                "client id and client secret must be given together".into(),
            ));
        }
        if self.instrument_list().is_empty() {
            return Err(RelayError::Config("no instruments configured".into()));
        }
        if self.currency.trim().is_empty() {
            return Err(RelayError::Config("currency must not be empty".into()));
        }
        Ok(())
    }

    pub fn instrument_list(&self) -> Vec<String> {
        self.instruments
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.client_id, &self.client_secret) {
            (Some(id), Some(secret)) => Some(Credentials::new(id, secret)),
            _ => None,
        }
    }

    pub fn rest_url(&self) -> &'static str {
        if self.mainnet {
            MAINNET_REST_URL
        } else {
            TESTNET_REST_URL
        }
    }

    pub fn ws_url(&self) -> &'static str {
        if self.mainnet {
            MAINNET_WS_URL
        } else {
            TESTNET_WS_URL
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn heartbeat(&self) -> Option<u64> {
        (self.heartbeat_secs > 0).then_some(self.heartbeat_secs)
    }

    pub fn network(&self) -> &'static str {
        if self.mainnet {
            "mainnet"
        } else {
            "testnet"
        }
    }
}
