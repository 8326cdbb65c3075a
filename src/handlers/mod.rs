pub mod api;
pub mod hub;
