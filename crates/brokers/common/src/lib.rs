pub mod paper;
pub mod retry;

pub use paper::{PaperBroker, PaperBrokerConfig};
pub use retry::RetryPolicy;

#[doc(hidden)]
pub mod __private {
    pub use tokio;
    pub use tracing;
}
