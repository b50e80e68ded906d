//! Route definitions for the marketplace order API

mod orders;

pub use orders::order_routes;
