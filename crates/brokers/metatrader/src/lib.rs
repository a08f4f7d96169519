//! MetaTrader 5 broker adapter.
//!
//! Talks to a bridge script running next to the MT5 terminal over TCP using
//! length-prefixed JSON request/reply messages.

pub mod client;
pub mod protocol;
pub mod retcode;

pub use client::{Credentials, MetaTraderBroker, MetaTraderConfig};
