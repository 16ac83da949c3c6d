//! Input sanitizing shared by the remote clients and the orchestrator.

mod text;
mod url_validator;

pub use text::{normalize_title, strip_control_chars};
pub use url_validator::{validate_feed_url, UrlValidationError};
