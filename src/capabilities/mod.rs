//! Ready-made capability handlers.

pub mod fixture;
pub mod http;

pub use fixture::FixtureCapability;
pub use http::HttpCapability;
