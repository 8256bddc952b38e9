//! Human review of triaged tickets: a service over the store and its REST
//! surface.

pub mod routes;
pub mod service;

pub use routes::review_routes;
pub use service::ReviewService;
