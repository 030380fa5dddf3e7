pub mod tcp;
pub mod traits;

pub use tcp::{TcpTransportListener, TcpTransportStream};
pub use traits::{TransportListener, TransportStream};
