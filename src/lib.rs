pub mod config;
pub mod debugger;
pub mod error;
pub mod instance;
pub mod notify;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod task;

pub use error::{BridgeError, ProtocolError};
pub use instance::BlenderInstance;
pub use registry::InstanceRegistry;
pub use server::TransportServer;
pub use session::BridgeSession;
