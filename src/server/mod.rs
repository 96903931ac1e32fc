pub mod listen;
pub mod router;
pub mod service;

pub use listen::{parse_listen_url, resolve_listen_url, serve, ListenUrl};
pub use router::{RouteRequest, RouteResponse, Router};
pub use service::profiler_router;
