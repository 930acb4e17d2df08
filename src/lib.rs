pub mod config;
pub mod logging;
pub mod services;

pub use services::stripe::{StripeService, StripeServiceError};
