pub mod maybe_tls;
pub mod timeout;

pub use maybe_tls::ServerStream;
pub use timeout::TimeoutIo;
