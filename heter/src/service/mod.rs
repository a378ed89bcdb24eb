mod registry;
mod server;

pub use registry::{HandlerRegistry, RegistryBuilder, ServiceHandler};
pub use server::{HeterServer, ServerBuilder, ServerState};
