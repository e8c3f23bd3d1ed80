use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Exchange an instrument is listed on.
///
/// Only `NyseArca` is a recognized equity venue. Every other exchange,
/// including ones we have never heard of, routes to the crypto source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Exchange {
    NyseArca,
    Crypto,
    Other(String),
}

impl Exchange {
    pub fn as_str(&self) -> &str {
        match self {
            Exchange::NyseArca => "NYSEARCA",
            Exchange::Crypto => "CRYPTO",
            Exchange::Other(name) => name,
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_uppercase();
        match name.as_str() {
            "" => Err(InstrumentError::EmptyExchange),
            "NYSEARCA" | "NYSE_ARCA" | "ARCA" => Ok(Exchange::NyseArca),
            "CRYPTO" => Ok(Exchange::Crypto),
            _ => Ok(Exchange::Other(name)),
        }
    }
}

/// Remote provider family an instrument is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Equity,
    Crypto,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Equity => "equity",
            DataSource::Crypto => "crypto",
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tradable symbol plus the exchange it trades on.
///
/// Text form is `SYMBOL-EXCHANGE`, split on the last `-` so that
/// hyphenated tickers like `BRK-B-NYSEARCA` survive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Instrument {
    symbol: String,
    exchange: Exchange,
}

impl Instrument {
    pub fn new(symbol: impl Into<String>, exchange: Exchange) -> Self {
        Self {
            symbol: symbol.into(),
            exchange,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    /// Timezone bars for this instrument are localized to.
    pub fn timezone(&self) -> Tz {
        match self.exchange {
            Exchange::NyseArca => chrono_tz::America::New_York,
            _ => chrono_tz::UTC,
        }
    }

    /// Data source this instrument is fetched from.
    pub fn datasource(&self) -> DataSource {
        match self.exchange {
            Exchange::NyseArca => DataSource::Equity,
            _ => DataSource::Crypto,
        }
    }

    /// Ticker as the equity provider expects it: `:suffix` stripped, upper-cased.
    pub fn normalized_ticker(&self) -> String {
        self.symbol
            .split(':')
            .next()
            .unwrap_or_default()
            .to_uppercase()
    }

    /// Symbol made safe for use in a cache file name.
    pub fn file_stem(&self) -> String {
        path_safe(&self.symbol)
    }

    /// `SYMBOL-EXCHANGE` made safe for use in a file name.
    pub fn qualified_file_stem(&self) -> String {
        path_safe(&self.to_string())
    }
}

fn path_safe(text: &str) -> String {
    text.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.symbol, self.exchange)
    }
}

impl FromStr for Instrument {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (symbol, exchange) = s
            .trim()
            .rsplit_once('-')
            .ok_or_else(|| InstrumentError::MissingExchange(s.to_string()))?;
        if symbol.is_empty() {
            return Err(InstrumentError::EmptySymbol(s.to_string()));
        }
        Ok(Self::new(symbol, exchange.parse()?))
    }
}

impl TryFrom<String> for Instrument {
    type Error = InstrumentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Instrument> for String {
    fn from(value: Instrument) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("instrument '{0}' has no exchange (expected SYMBOL-EXCHANGE)")]
    MissingExchange(String),

    #[error("instrument '{0}' has an empty symbol")]
    EmptySymbol(String),

    #[error("exchange name is empty")]
    EmptyExchange,
}
