pub mod api;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod metrics_defs;
pub mod notify;
pub mod source;
#[cfg(any(test, feature = "testutils"))]
pub mod testutils;
pub mod transform;

pub use clock::{Clock, SystemClock};
pub use coordinator::{Coordinator, RunOutcome, RunSummary};
pub use errors::IngestError;
pub use notify::{HttpTransport, Notifier, NotifyError, Transport};
pub use source::{RaceSource, UpstreamSource};
