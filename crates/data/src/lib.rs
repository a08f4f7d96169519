pub mod csv_loader;

pub use csv_loader::{load_candles, load_candles_from_reader};

/// Errors raised while loading historical data.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("Data not found: {0}")]
    NotFound(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
