//! MT5 trade server return codes.

/// Order placed (pending order accepted).
pub const PLACED: u32 = 10008;
/// Request completed.
pub const DONE: u32 = 10009;
/// Only part of the request was completed.
pub const DONE_PARTIAL: u32 = 10010;
pub const INVALID_PRICE: u32 = 10015;
pub const INVALID_STOPS: u32 = 10016;

pub const TABLE: &[(u32, &str)] = &[
    (10004, "Requote"),
    (10006, "Request rejected"),
    (10007, "Request canceled by trader"),
    (PLACED, "Order placed"),
    (DONE, "Request completed"),
    (DONE_PARTIAL, "Only part of the request was completed"),
    (10011, "Request processing error"),
    (10012, "Request canceled by timeout"),
    (10013, "Invalid request"),
    (10014, "Invalid volume in the request"),
    (INVALID_PRICE, "Invalid price in the request"),
    (INVALID_STOPS, "Invalid stops in the request"),
    (10017, "Trade is disabled"),
    (10018, "Market is closed"),
    (10019, "Not enough money to complete the request"),
    (10020, "Prices changed"),
    (10021, "No quotes to process the request"),
    (10022, "Invalid order expiration date"),
    (10023, "Order state changed"),
    (10024, "Too frequent requests"),
    (10025, "No changes in request"),
    (10026, "Autotrading disabled by server"),
    (10027, "Autotrading disabled by client terminal"),
    (10028, "Request locked for processing"),
    (10029, "Order or position frozen"),
    (10030, "Invalid order filling type"),
    (10031, "No connection with trade server"),
    (10032, "Only allowed for live accounts"),
    (10033, "Pending orders limit reached"),
    (10034, "Order/position volume limit reached for symbol"),
    (10035, "Incorrect or prohibited order type"),
    (10036, "Position already closed"),
    (10038, "Close volume exceeds position volume"),
    (10039, "Close order already exists for position"),
    (10040, "Open positions limit reached"),
    (10041, "Activation rejected, order canceled"),
    (10042, "Only long positions allowed"),
    (10043, "Only short positions allowed"),
    (10044, "Only position closing allowed"),
    (10045, "Only FIFO closing allowed"),
    (10046, "Opposite positions disabled (hedging prohibited)"),
];

/// Human-readable reason for a retcode.
pub fn describe(code: u32) -> String {
    TABLE
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, text)| text.to_string())
        .unwrap_or_else(|| format!("Unknown error (retcode: {})", code))
}

/// Whether the request was executed (fully or as a pending order).
pub fn is_success(code: u32) -> bool {
    matches!(code, PLACED | DONE | DONE_PARTIAL)
}
