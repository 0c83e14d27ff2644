pub mod descriptor;
pub mod errors;
pub mod ids;
pub mod messages;
pub mod state;

pub use descriptor::{ServiceDescriptor, ServiceType};
pub use errors::CoordinatorError;
pub use ids::{ConnectionId, ParticipantId, TenantId};
pub use messages::Envelope;
pub use state::ConnectionState;
