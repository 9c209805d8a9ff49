//! Asset monitoring core: scanners value on-chain positions into snapshot
//! batches, the ledger tracks value entering and leaving the portfolio, and
//! the summary relates the two.

pub mod error;
pub mod ledger;
pub mod notify;
pub mod orchestrator;
pub mod price;
pub mod rate_limiter;
pub mod scanner;
pub mod store;
pub mod summary;
pub mod units;

pub use error::{
    LedgerError, MonitorError, PriceError, RateLimitError, ScanQueryError, ScannerInitError,
    StoreError,
};
pub use ledger::{FlowLedger, FlowOptions};
pub use notify::{NoopNotifier, Notifier, TelegramNotifier};
pub use orchestrator::{AssetMonitor, CycleState, ScanResult};
pub use price::{PriceResolver, PriceSource};
pub use rate_limiter::RateLimiter;
pub use scanner::{ChainScanner, OmittedPosition, QueryOutput, ScannerRegistry};
pub use store::{AssetStore, GroupRef, MemoryStore, PgStore};
pub use summary::{Summary, SummaryAggregator};
