pub mod manager;
pub mod queue;
pub mod reactor;
pub mod reconcile;

pub use manager::{ManagerError, TransferManager};
pub use queue::{JobOutcome, QueueError, QueueEvent, QueueLimits, Reservation, TransferQueue, TransferQueuePool};
pub use reactor::{ChangeReactor, SubmitSummary, SweepSummary};
pub use reconcile::RetryPolicy;
