//! Contracts the coordinator needs from its surroundings: the service
//! discovery / RPC bus and the ordered event stream, plus in-process
//! implementations of both and a mock media bridge worker.

pub mod error;
pub mod local;
pub mod mock;
pub mod rpc;
pub mod stream;

pub use error::{BusError, StreamError};
pub use local::LocalBus;
pub use mock::{MockBehavior, MockMediaBridge};
pub use rpc::{CommandHandler, DiscoveryListener, RpcCallRequest, ServiceBus};
pub use stream::{EventStream, MemoryStream, StreamEntry};
