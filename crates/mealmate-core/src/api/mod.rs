//! Request dispatching for the mealmate REST API.
//!
//! This module provides the `Dispatcher`, which every business endpoint
//! wrapper goes through. It answers reads from the `ResponseCache` when it
//! can, sends everything else over a `Transport`, and hands mutating calls
//! that fail for lack of connectivity to the `OfflineQueue`.
//!
//! Requests carry a bearer token obtained from a `TokenProvider` at send
//! time; tokens are never written into the queue.

pub mod client;
pub mod error;
pub mod request;
pub mod transport;

pub use client::{Dispatcher, DispatcherSettings};
pub use error::{ApiError, ErrorKind};
pub use request::{ApiResult, Dispatched, Method, RequestOptions, QUEUED_OFFLINE};
pub use transport::{HttpRequest, ReqwestTransport, Transport};
