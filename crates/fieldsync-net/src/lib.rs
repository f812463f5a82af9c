pub mod clock;
pub mod mem;
pub mod traits;
pub mod udp;

pub use clock::{Clock, ManualClock, SystemClock};
pub use mem::{MemMesh, MemTransport};
pub use traits::{Transport, TransportError};
pub use udp::UdpTransport;
