//! REST API access for the FitSocial backend.
//!
//! This module provides the `Gateway`, the single choke point for
//! authenticated calls, plus the `Transport` seam it sends through.
//!
//! The API uses JWT bearer tokens. An expired access token is traded for a
//! new pair at `/auth/refresh`, shared by every call that failed meanwhile.

pub mod error;
pub mod gateway;
pub mod request;
pub mod resources;
pub mod transport;

pub use error::ApiError;
pub use gateway::{Gateway, GatewaySettings};
pub use request::{ApiRequest, ApiResponse, RequestBody};
pub use transport::{HttpTransport, Transport};
