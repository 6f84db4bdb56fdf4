//! Requests, response snapshots and the network they travel over.

mod client;
mod types;

pub use client::{FetchError, HttpClient, Network};
pub use types::{Destination, Request, RequestKey, Response};
