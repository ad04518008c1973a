//! Pilot API surface

pub mod http;

pub use http::HttpApi;
