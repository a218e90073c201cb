//! Utility functions for common operations.
//!
//! - **HTTP client**: the shared `reqwest` client with a bounded redirect policy
//! - **URL validation**: scheme and network policy checks for outbound requests
//! - **Text processing**: payload truncation and control-character stripping

mod http;
mod text;
mod url_validator;

pub use http::build_http_client;
pub use text::{strip_control_chars, truncate_chars};
pub use url_validator::{validate_url, NetworkPolicy, UrlValidationError};
