mod middleware;
mod routes;

pub use middleware::{REQUEST_ID_HEADER, RequestContext, log_responses, set_request_context};
pub use routes::{HttpState, Product, build_router, rate_limit};
