//! Identity, renewal, storage and CA block parsing.

use anyhow::Result;
use std::path::PathBuf;
use tracing::trace;

use crate::identity::{
    default_common_name, IdentityConfig, SniLearningConfig, DEFAULT_MAX_LEARNED_SANS,
};
use crate::renewal::RenewalConfig;
use crate::storage::{CaConfig, StorageConfig};

use super::helpers::{get_bool_entry, get_child, get_int_entry, get_string_entry, get_string_list, int_to};

pub fn parse_identity_config(node: &kdl::KdlNode) -> Result<IdentityConfig> {
    let common_name = get_string_entry(node, "common-name").unwrap_or_else(default_common_name);
    let organization =
        get_string_entry(node, "organization").unwrap_or_else(|| common_name.clone());

    let sni_learning = match get_child(node, "sni-learning") {
        Some(block) => SniLearningConfig {
            enabled: get_bool_entry(block, "enabled").unwrap_or(false),
            allowed_suffixes: get_string_list(block, "allowed-suffixes"),
            allow_ip: get_bool_entry(block, "allow-ip").unwrap_or(false),
            max_learned_sans: match get_int_entry(block, "max-learned-sans") {
                Some(value) => int_to(value, "max-learned-sans")?,
                None => DEFAULT_MAX_LEARNED_SANS,
            },
        },
        None => SniLearningConfig::default(),
    };

    let config = IdentityConfig {
        common_name,
        organization,
        sans: get_string_list(node, "sans"),
        sni_learning,
    };

    trace!(
        common_name = %config.common_name,
        sans = config.sans.len(),
        sni_learning = config.sni_learning.enabled,
        "Parsed identity"
    );

    Ok(config)
}

pub fn parse_renewal_config(node: &kdl::KdlNode) -> Result<RenewalConfig> {
    let defaults = RenewalConfig::default();

    Ok(RenewalConfig {
        lead_days: opt_int(node, "lead-days")?.unwrap_or(defaults.lead_days),
        validity_days: opt_int(node, "validity-days")?.unwrap_or(defaults.validity_days),
        check_interval_secs: opt_int(node, "check-interval-secs")?
            .unwrap_or(defaults.check_interval_secs),
        max_attempts: opt_int(node, "max-attempts")?.unwrap_or(defaults.max_attempts),
        backoff_base_ms: opt_int(node, "backoff-base-ms")?.unwrap_or(defaults.backoff_base_ms),
        backoff_max_ms: opt_int(node, "backoff-max-ms")?.unwrap_or(defaults.backoff_max_ms),
    })
}

pub fn parse_storage_config(node: &kdl::KdlNode) -> Result<StorageConfig> {
    let defaults = StorageConfig::default();

    Ok(StorageConfig {
        slot: get_string_entry(node, "slot").unwrap_or(defaults.slot),
        data_dir: get_string_entry(node, "data-dir")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir),
        durable_dir: get_string_entry(node, "durable-dir")
            .map(PathBuf::from)
            .unwrap_or(defaults.durable_dir),
        poll_interval_secs: opt_int(node, "poll-interval-secs")?
            .unwrap_or(defaults.poll_interval_secs),
    })
}

pub fn parse_ca_config(node: &kdl::KdlNode) -> Result<CaConfig> {
    let defaults = CaConfig::default();

    Ok(CaConfig {
        cert_file: get_string_entry(node, "cert-file")
            .map(PathBuf::from)
            .unwrap_or(defaults.cert_file),
        key_file: get_string_entry(node, "key-file")
            .map(PathBuf::from)
            .unwrap_or(defaults.key_file),
    })
}

fn opt_int<T: TryFrom<i128>>(node: &kdl::KdlNode, name: &str) -> Result<Option<T>> {
    get_int_entry(node, name)
        .map(|v| int_to(v, name))
        .transpose()
}
