pub mod auth;
pub mod dispatcher;
pub mod h2_pool;
pub mod headers;
pub mod registry;
pub mod route;
pub mod server;
pub mod target;
pub mod telemetry;
pub mod tunnel;

#[cfg(test)]
mod tests;

pub use registry::{ProxyContext, Registry};
pub use route::Route;
pub use server::ProxyServer;
