//! Typed errors returned at the exchange boundary.

use thiserror::Error;

/// Message fragments the exchange uses when it rejects an instrument.
const UNSUPPORTED_MARKERS: [&str; 5] = [
    "not supported symbol",
    "symbol invalid",
    "invalid symbol",
    "symbol not exist",
    "instrument not found",
];

/// How the reconciler should react to a failed exchange call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network, timeout or parse failure: skip and retry next cycle.
    Transient,
    /// The exchange rejected the instrument: persist and exclude it.
    UnsupportedInstrument,
    /// Insufficient funds, unavailable price or similar: skip this cycle only.
    SkipSymbol,
}

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("exchange error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("symbol not supported: {0}")]
    UnsupportedSymbol(String),

    #[error("price unavailable for {0}")]
    PriceUnavailable(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("order rejected: {0}")]
    Rejected(String),
}

impl ExchangeError {
    /// True when the error means the exchange does not list this symbol.
    pub fn is_unsupported_symbol(&self) -> bool {
        match self {
            ExchangeError::UnsupportedSymbol(_) => true,
            other => message_indicates_unsupported(&other.to_string()),
        }
    }

    pub fn class(&self) -> ErrorClass {
        if self.is_unsupported_symbol() {
            return ErrorClass::UnsupportedInstrument;
        }
        match self {
            ExchangeError::Transport(_) | ExchangeError::Parse(_) => ErrorClass::Transient,
            _ => ErrorClass::SkipSymbol,
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ExchangeError::Parse(err.to_string())
        } else {
            ExchangeError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        ExchangeError::Parse(err.to_string())
    }
}

/// Case-insensitive check of a raw error message against the known
/// "unsupported instrument" phrasings.
pub fn message_indicates_unsupported(message: &str) -> bool {
    let lower = message.to_lowercase();
    UNSUPPORTED_MARKERS.iter().any(|marker| lower.contains(marker))
}
