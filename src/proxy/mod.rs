pub mod context;
pub mod handler;

pub use context::{full_body, BoxBody, RequestContext};
pub use handler::{handle_request, route_and_dispatch, RequestParts};
