pub mod auth;
pub mod client;

pub use auth::{AuthError, AuthStrategy};
pub use client::{HttpClient, HttpError, HttpResponse, RequestBody, RequestSpec};
