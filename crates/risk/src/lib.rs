pub mod session;
pub mod targets;

pub use session::TradingSession;
pub use targets::{AtrPointsTarget, EquityGuard, EquityTargets, TargetHit};
