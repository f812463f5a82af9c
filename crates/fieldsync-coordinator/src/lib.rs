pub mod coordinator;
pub mod tracker;

pub use coordinator::{Coordinator, IssueReport, Outcome};
pub use tracker::{NodeTracker, NodeTrackingEntry, RetryPolicy, TimeoutAction, TrackerState};
