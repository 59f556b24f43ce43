//! Gateway: authentication, impersonation and forwarding

pub mod auth;
pub mod impersonate;
pub mod proxy;
mod router;
mod server;

pub use auth::{Authenticator, auth_middleware};
pub use proxy::UpstreamTransport;
pub use router::{AppState, WhoAmI, create_router};
pub use server::Gateway;
