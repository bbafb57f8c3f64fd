//! Leaf certificate generation and validation.

use chrono::{DateTime, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

use crate::ca::CertificateAuthority;
use crate::errors::SigningError;
use crate::identity::{RequiredIdentity, SanSet};
use crate::record::CertificateRecord;

/// Default leaf validity (365 days)
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(365 * 86400);

/// Default renewal lead (90 days)
pub const DEFAULT_RENEWAL_LEAD: Duration = Duration::from_secs(90 * 86400);

/// Outcome of checking a record against the required identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Ok,
    /// Not signed by the configured CA
    WrongIssuer,
    Expired,
    /// Names the record does not cover
    MissingSans(SanSet),
    /// Within the renewal lead of `not-after`
    Expiring,
}

impl Validation {
    pub fn is_ok(&self) -> bool {
        matches!(self, Validation::Ok)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Validation::Ok => "ok",
            Validation::WrongIssuer => "wrong_issuer",
            Validation::Expired => "expired",
            Validation::MissingSans(_) => "missing_sans",
            Validation::Expiring => "expiring",
        }
    }
}

/// Signs leaf certificates with one CA
#[derive(Debug, Clone)]
pub struct CertificateFactory {
    ca: Arc<CertificateAuthority>,
    validity: Duration,
}

impl CertificateFactory {
    pub fn new(ca: Arc<CertificateAuthority>, validity: Duration) -> Self {
        Self { ca, validity }
    }

    pub fn ca(&self) -> &Arc<CertificateAuthority> {
        &self.ca
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// Generate a freshly-signed leaf for `identity`.
    ///
    /// IP literals become IP SANs, everything else a DNS SAN.
    pub fn generate_leaf(
        &self,
        identity: &RequiredIdentity,
    ) -> Result<CertificateRecord, SigningError> {
        self.generate_leaf_until(identity, None)
    }

    /// Like [`generate_leaf`](Self::generate_leaf), but the leaf never
    /// expires before `min_not_after`.
    ///
    /// A replacement must not expire earlier than the certificate it
    /// replaces, even when this factory's validity is shorter than the one
    /// that issued it.
    pub fn generate_leaf_until(
        &self,
        identity: &RequiredIdentity,
        min_not_after: Option<DateTime<Utc>>,
    ) -> Result<CertificateRecord, SigningError> {
        let mut params = CertificateParams::new(Vec::<String>::new())
            .map_err(|e| SigningError::Signing(e.to_string()))?;
        params.is_ca = IsCa::ExplicitNoCa;
        params.use_authority_key_identifier_extension = true;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let now = SystemTime::now();
        params.not_before = now.into();
        let mut not_after = now + self.validity;
        if let Some(min) = min_not_after {
            not_after = not_after.max(SystemTime::from(min));
        }
        params.not_after = not_after.into();

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, identity.common_name.as_str());
        if !identity.organization.is_empty() {
            distinguished_name.push(DnType::OrganizationName, identity.organization.as_str());
        }
        params.distinguished_name = distinguished_name;

        for name in identity.sans.iter() {
            let san = match name.parse::<IpAddr>() {
                Ok(ip) => SanType::IpAddress(ip),
                Err(_) => SanType::DnsName(name.try_into().map_err(|e: rcgen::Error| {
                    SigningError::InvalidSan {
                        san: name.to_string(),
                        reason: e.to_string(),
                    }
                })?),
            };
            params.subject_alt_names.push(san);
        }

        let key = KeyPair::generate().map_err(|e| SigningError::Signing(e.to_string()))?;
        let cert = params
            .signed_by(&key, self.ca.issuer())
            .map_err(|e| SigningError::Signing(e.to_string()))?;

        let record = CertificateRecord::from_pem(cert.pem(), key.serialize_pem())?;

        debug!(
            common_name = %identity.common_name,
            sans = %record.sans(),
            not_after = %record.not_after(),
            fingerprint = %record.fingerprint(),
            "Generated serving certificate"
        );

        Ok(record)
    }

    /// Check `record` against this factory's CA and `identity`.
    pub fn validate(
        &self,
        record: &CertificateRecord,
        identity: &RequiredIdentity,
        now: DateTime<Utc>,
        renewal_lead: Duration,
    ) -> Validation {
        validate(record, &self.ca, identity, now, renewal_lead)
    }
}

/// Pure validation of a record.
///
/// Precedence when several results apply:
/// `WrongIssuer > Expired > MissingSans > Expiring`.
pub fn validate(
    record: &CertificateRecord,
    ca: &CertificateAuthority,
    identity: &RequiredIdentity,
    now: DateTime<Utc>,
    renewal_lead: Duration,
) -> Validation {
    if !issued_by(record, ca) {
        return Validation::WrongIssuer;
    }

    if record.not_after() <= now {
        return Validation::Expired;
    }

    let missing = identity.sans.missing_from(record.sans());
    if !missing.is_empty() {
        return Validation::MissingSans(missing);
    }

    let lead = chrono::Duration::from_std(renewal_lead).unwrap_or(chrono::Duration::MAX);
    let remaining = record.not_after() - now;
    if remaining <= lead {
        return Validation::Expiring;
    }

    Validation::Ok
}

fn issued_by(record: &CertificateRecord, ca: &CertificateAuthority) -> bool {
    if record.issuer() != ca.subject() {
        return false;
    }

    match (record.authority_key_id(), ca.key_id()) {
        (Some(leaf), Some(ca)) => leaf == ca,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory(validity: Duration) -> CertificateFactory {
        let ca = CertificateAuthority::generate_self_signed("Factory Test CA").unwrap();
        CertificateFactory::new(Arc::new(ca), validity)
    }

    fn identity(sans: &[&str]) -> RequiredIdentity {
        RequiredIdentity::new("certmesh", "certmesh", sans.iter().collect())
    }

    #[test]
    fn test_generated_leaf_is_valid() {
        let factory = factory(DEFAULT_VALIDITY);
        let identity = identity(&["localhost", "node1.cluster.local", "10.0.0.5"]);

        let record = factory.generate_leaf(&identity).unwrap();

        assert_eq!(record.sans(), &identity.sans);
        assert_eq!(
            factory.validate(&record, &identity, Utc::now(), DEFAULT_RENEWAL_LEAD),
            Validation::Ok
        );

        let lifetime = record.not_after() - record.not_before();
        assert!((lifetime.num_days() - 365).abs() <= 1);
    }

    #[test]
    fn test_leaf_never_expires_before_minimum() {
        let long = factory(DEFAULT_VALIDITY);
        let short = CertificateFactory::new(long.ca().clone(), Duration::from_secs(200 * 86400));
        let required = identity(&["localhost"]);

        let existing = long.generate_leaf(&required).unwrap();
        let replacement = short
            .generate_leaf_until(&required, Some(existing.not_after()))
            .unwrap();
        assert!(replacement.not_after() >= existing.not_after());

        // An earlier minimum leaves the factory's own validity in charge
        let earlier = Utc::now() + chrono::Duration::days(1);
        let record = short.generate_leaf_until(&required, Some(earlier)).unwrap();
        assert!((record.not_after() - record.not_before()).num_days() >= 199);
    }

    #[test]
    fn test_missing_sans_reported_when_not_expiring() {
        let factory = factory(DEFAULT_VALIDITY);
        let record = factory.generate_leaf(&identity(&["localhost"])).unwrap();

        let grown = identity(&["localhost", "node2"]);
        let result = factory.validate(&record, &grown, Utc::now(), DEFAULT_RENEWAL_LEAD);
        assert_eq!(
            result,
            Validation::MissingSans(["node2"].into_iter().collect())
        );
    }

    #[test]
    fn test_expiring_within_lead() {
        let factory = factory(Duration::from_secs(30 * 86400));
        let required = identity(&["localhost"]);
        let record = factory.generate_leaf(&required).unwrap();

        let result = factory.validate(&record, &required, Utc::now(), DEFAULT_RENEWAL_LEAD);
        assert_eq!(result, Validation::Expiring);

        let result = factory.validate(
            &record,
            &required,
            Utc::now(),
            Duration::from_secs(7 * 86400),
        );
        assert_eq!(result, Validation::Ok);
    }

    #[test]
    fn test_precedence() {
        let factory = factory(Duration::from_secs(30 * 86400));
        let record = factory.generate_leaf(&identity(&["localhost"])).unwrap();
        let grown = identity(&["localhost", "node2"]);

        // Expiring and missing SANs: missing SANs wins
        let result = factory.validate(&record, &grown, Utc::now(), DEFAULT_RENEWAL_LEAD);
        assert!(matches!(result, Validation::MissingSans(_)));

        // Expired and missing SANs: expired wins
        let later = Utc::now() + chrono::Duration::days(31);
        let result = factory.validate(&record, &grown, later, DEFAULT_RENEWAL_LEAD);
        assert_eq!(result, Validation::Expired);

        // Another CA's record: wrong issuer wins over everything
        let other_ca = CertificateAuthority::generate_self_signed("Other CA").unwrap();
        let other = CertificateFactory::new(Arc::new(other_ca), DEFAULT_VALIDITY);
        let result = other.validate(&record, &grown, later, DEFAULT_RENEWAL_LEAD);
        assert_eq!(result, Validation::WrongIssuer);
    }

    #[test]
    fn test_ca_with_same_name_but_new_key_is_wrong_issuer() {
        let old = factory(DEFAULT_VALIDITY);
        let rotated = factory(DEFAULT_VALIDITY);
        assert_eq!(old.ca().subject(), rotated.ca().subject());

        let required = identity(&["localhost"]);
        let record = old.generate_leaf(&required).unwrap();

        if old.ca().key_id().is_some() && rotated.ca().key_id().is_some() {
            assert_eq!(
                rotated.validate(&record, &required, Utc::now(), DEFAULT_RENEWAL_LEAD),
                Validation::WrongIssuer
            );
        }
    }

    #[test]
    fn test_invalid_dns_san() {
        let factory = factory(DEFAULT_VALIDITY);
        let mut required = identity(&["localhost"]);
        required.sans.insert("bad name\u{e9}");

        let err = factory.generate_leaf(&required).unwrap_err();
        assert!(matches!(err, SigningError::InvalidSan { .. }));
    }
}
