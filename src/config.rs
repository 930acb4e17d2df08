use std::env;

use crate::logging::LogFormat;
use crate::services::stripe::StripeServiceError;

#[derive(Clone, Debug)]
pub struct StripeSettings {
    pub secret_key: String,
    /// Alternate API host, e.g. a local stripe-mock. `None` talks to api.stripe.com.
    pub api_base: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub stripe: StripeSettings,
    pub log_format: LogFormat,
}

impl Config {
    pub fn from_env() -> Result<Self, StripeServiceError> {
        dotenv::dotenv().ok(); // Load .env file

        let secret_key = env::var("STRIPE_SECRET_KEY")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| StripeServiceError::Config("STRIPE_SECRET_KEY must be set".into()))?;

        let api_base = env::var("STRIPE_API_BASE")
            .ok()
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty());

        let log_format = match env::var("LOG_FORMAT") {
            Ok(raw) => raw
                .parse()
                .map_err(|err: anyhow::Error| StripeServiceError::Config(err.to_string()))?,
            Err(_) => LogFormat::default(),
        };

        Ok(Config {
            stripe: StripeSettings {
                secret_key,
                api_base,
            },
            log_format,
        })
    }
}
