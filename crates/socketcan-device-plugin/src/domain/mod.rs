pub mod allocation;
pub mod lister;
pub mod worker;

pub use allocation::Allocation;
pub use lister::Lister;
pub use worker::AllocationOutcome;
pub use worker::AllocationWorker;
pub use worker::Backoff;
