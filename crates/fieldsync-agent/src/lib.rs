pub mod agent;
pub mod store;
pub mod validator;

pub use agent::{AgentState, NodeAgent, Outbound};
pub use store::{apply, ConfigHandle, LiveConfig};
pub use validator::{validate, ValidatedSet};
