use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentKind {
    Future,
    Option,
    Spot,
    FutureCombo,
    OptionCombo,
}

impl std::fmt::Display for InstrumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstrumentKind::Future => "future",
            InstrumentKind::Option => "option",
            InstrumentKind::Spot => "spot",
            InstrumentKind::FutureCombo => "future_combo",
            InstrumentKind::OptionCombo => "option_combo",
        };
        write!(f, "{}", s)
    }
}

/// Entry from `public/get_instruments`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub instrument_name: String,
    pub kind: InstrumentKind,
    pub base_currency: String,
    #[serde(default)]
    pub quote_currency: Option<String>,
    pub tick_size: f64,
    pub min_trade_amount: f64,
    #[serde(default)]
    pub contract_size: Option<f64>,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub expiration_timestamp: Option<i64>,
}

/// Currency an instrument is grouped under by Deribit's `*_by_currency`
/// calls: the base for inverse instruments (`BTC-PERPETUAL`), the settlement
/// currency for linear ones (`BTC_USDC-PERPETUAL` is `USDC`).
pub fn instrument_currency(instrument_name: &str) -> &str {
    let base = instrument_name
        .split_once('-')
        .map_or(instrument_name, |(base, _)| base);
    base.split_once('_').map_or(base, |(_, settlement)| settlement)
}
