//! CA material validation
//!
//! Validates that the CA certificate and key exist, parse, and that the CA
//! is usable for signing (a CA flag and an unexpired validity window).

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;
use std::path::Path;
use std::time::{Duration, SystemTime};

/// Validate the configured CA certificate and key files
pub async fn validate_ca_files(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let ca = &config.ca;

    if !tokio::fs::try_exists(&ca.cert_file).await.unwrap_or(false) {
        result.add_error(ValidationError::new(
            ErrorCategory::Certificate,
            format!("CA certificate not found: {:?}", ca.cert_file),
        ));
        return result;
    }

    if !tokio::fs::try_exists(&ca.key_file).await.unwrap_or(false) {
        result.add_error(ValidationError::new(
            ErrorCategory::Certificate,
            format!("CA private key not found: {:?}", ca.key_file),
        ));
        return result;
    }

    match load_and_validate_ca(&ca.cert_file).await {
        Ok(Some(warning)) => result.add_warning(warning),
        Ok(None) => {}
        Err(e) => result.add_error(e),
    }

    if let Err(e) = check_key_pem(&ca.key_file).await {
        result.add_error(e);
    }

    result
}

/// Load the CA certificate and check flags and expiry
async fn load_and_validate_ca(
    cert_path: &Path,
) -> Result<Option<ValidationWarning>, ValidationError> {
    let cert_pem = tokio::fs::read(cert_path).await.map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to read CA certificate {:?}: {}", cert_path, e),
        )
    })?;

    let pem = pem::parse(&cert_pem).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to parse CA certificate {:?}: {}", cert_path, e),
        )
    })?;

    let (_, cert) = x509_parser::parse_x509_certificate(pem.contents()).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Invalid X509 certificate {:?}: {}", cert_path, e),
        )
    })?;

    if !cert.is_ca() {
        return Err(ValidationError::new(
            ErrorCategory::Certificate,
            format!("Certificate {:?} is not a CA certificate", cert_path),
        ));
    }

    let now = SystemTime::now();
    let not_after = cert.validity().not_after.timestamp().max(0) as u64;
    let expiry_time = SystemTime::UNIX_EPOCH + Duration::from_secs(not_after);

    if expiry_time < now {
        return Err(ValidationError::new(
            ErrorCategory::Certificate,
            format!(
                "CA certificate expired: {:?} (expired at {})",
                cert_path,
                cert.validity().not_after
            ),
        ));
    }

    // Leaves cannot outlive their issuer in practice
    let one_year = Duration::from_secs(365 * 86400);
    if expiry_time < now + one_year {
        return Ok(Some(ValidationWarning::new(format!(
            "CA certificate expires within a year: {:?} (expires at {})",
            cert_path,
            cert.validity().not_after
        ))));
    }

    Ok(None)
}

async fn check_key_pem(key_path: &Path) -> Result<(), ValidationError> {
    let key_pem = tokio::fs::read(key_path).await.map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to read CA private key {:?}: {}", key_path, e),
        )
    })?;

    let pem = pem::parse(&key_pem).map_err(|e| {
        ValidationError::new(
            ErrorCategory::Certificate,
            format!("Failed to parse CA private key {:?}: {}", key_path, e),
        )
    })?;

    if !pem.tag().ends_with("PRIVATE KEY") {
        return Err(ValidationError::new(
            ErrorCategory::Certificate,
            format!(
                "CA key file {:?} holds a '{}' block, expected a private key",
                key_path,
                pem.tag()
            ),
        ));
    }

    Ok(())
}
