//! Listener address validation
//!
//! Checks that the configured listener address can actually be bound.

use super::{ErrorCategory, ValidationError, ValidationResult};
use crate::Config;
use tokio::net::TcpListener;

/// Try binding the listener address and release it immediately
pub async fn validate_bind_address(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let address = config.listener.socket_address();

    match TcpListener::bind(&address).await {
        Ok(listener) => drop(listener),
        Err(e) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Network,
                format!("Cannot bind listener address '{}': {}", address, e),
            ));
        }
    }

    result
}
