pub mod fjall;
pub mod keys;
pub mod mem;
pub mod traits;

pub use fjall::{FjallAuditLog, FjallConfigStorage, FjallStore};
pub use mem::{MemAuditLog, MemConfigStorage};
pub use traits::{AuditLog, ConfigStorage};
