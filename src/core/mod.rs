pub mod batch;
pub mod circuit_breaker;
pub mod circular_buffer;
pub mod config;
pub mod envelope;
pub mod failover;
pub mod frame;
pub mod health;
pub mod heartbeat;
pub mod rate_limit;
pub mod reconnect;
pub mod reliability;
pub mod timer;
pub mod types;

pub use batch::*;
pub use circuit_breaker::*;
pub use circular_buffer::*;
pub use config::*;
pub use envelope::*;
pub use failover::*;
pub use frame::*;
pub use health::*;
pub use heartbeat::*;
pub use rate_limit::*;
pub use reconnect::*;
pub use reliability::*;
pub use timer::*;
pub use types::*;
