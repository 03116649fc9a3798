//! Bulk-send dispatch: job model, recipient validation, retry policy,
//! outbound transport and the per-device worker pool.

pub mod address;
pub mod model;
pub mod pool;
pub mod retry;
pub mod transport;

pub use model::{Job, JobItem, JobItemStatus, JobProgress, JobStatus, Outcome};
pub use pool::Dispatcher;
pub use retry::{RetryDecision, RetryPolicy};
pub use transport::{HttpGatewayTransport, OutboundTransport};
