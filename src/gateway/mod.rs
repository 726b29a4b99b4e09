//! The request gateway: middleware chain, HTTP surface, reverse proxy, and
//! WebSocket bridge.

pub mod admin;
pub mod handlers;
pub mod middleware;
pub mod proxy;
pub mod router;
pub mod server;
pub mod ws;

pub use router::{AppState, create_router};
pub use server::Gateway;
