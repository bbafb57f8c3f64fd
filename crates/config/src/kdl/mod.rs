//! KDL configuration format.
//!
//! ```kdl
//! server {
//!     drain-timeout-secs 30
//! }
//! listener {
//!     bind-address "0.0.0.0"
//!     port 9345
//!     min-tls-version "1.2"
//! }
//! identity {
//!     common-name "certmesh"
//!     sans "node1.cluster.local" "10.0.0.5"
//! }
//! renewal {
//!     lead-days 90
//! }
//! storage {
//!     data-dir "/var/lib/certmesh"
//!     durable-dir "/mnt/shared/certmesh"
//! }
//! ca {
//!     cert-file "/etc/certmesh/server-ca.crt"
//!     key-file "/etc/certmesh/server-ca.key"
//! }
//! ```

mod helpers;
mod sections;
mod server;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::Config;

pub use sections::{parse_ca_config, parse_identity_config, parse_renewal_config, parse_storage_config};
pub use server::{parse_listener_config, parse_server_config};

/// Parse a complete KDL configuration document
pub fn parse_config(content: &str) -> Result<Config> {
    let doc: kdl::KdlDocument = content
        .parse()
        .map_err(|e: kdl::KdlError| anyhow::anyhow!("Invalid KDL: {}", e))?;

    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => {
                config.server = parse_server_config(node).context("Invalid server block")?;
            }
            "listener" => {
                config.listener = parse_listener_config(node).context("Invalid listener block")?;
            }
            "identity" => {
                config.identity = parse_identity_config(node).context("Invalid identity block")?;
            }
            "renewal" => {
                config.renewal = parse_renewal_config(node).context("Invalid renewal block")?;
            }
            "storage" => {
                config.storage = parse_storage_config(node).context("Invalid storage block")?;
            }
            "ca" => {
                config.ca = parse_ca_config(node).context("Invalid ca block")?;
            }
            other => {
                warn!(block = %other, "Ignoring unknown configuration block");
            }
        }
    }

    debug!(
        address = %config.listener.socket_address(),
        slot = %config.storage.slot,
        "Parsed KDL configuration"
    );

    Ok(config)
}
