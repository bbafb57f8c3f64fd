//! Serving certificate coordination.
//!
//! The coordinator owns the active certificate and moves through
//!
//! ```text
//! Bootstrapping ──> Serving <──> Renewing
//!                      │
//!                      └──> Draining
//! ```
//!
//! Every path that may change the active certificate (bootstrap, the
//! periodic check, a peer update from the durable watch) runs the same
//! convergence loop under one async mutex:
//!
//! 1. load the slot (caches first; the durable tier when a cached record is
//!    unusable)
//! 2. adopt it if it validates against the required identity
//! 3. otherwise generate a candidate covering the required SANs plus every
//!    SAN already served, and compare-and-swap it at the loaded revision
//! 4. on conflict go back to 1, with jittered backoff, up to a bounded number
//!    of attempts
//!
//! The durable compare-and-swap is the only arbiter between processes.

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use rustls::sign::CertifiedKey;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use certmesh_common::{Backoff, SlotKey};
use certmesh_config::RenewalConfig;

use crate::errors::{CoordinatorError, StoreError};
use crate::factory::{CertificateFactory, Validation};
use crate::identity::{RequiredIdentity, SanSet, SniFilter};
use crate::record::StorageSlot;
use crate::store::{SaveOutcome, Tier, TieredCertStore};

// State constants for AtomicU8
const STATE_BOOTSTRAPPING: u8 = 0;
const STATE_SERVING: u8 = 1;
const STATE_RENEWING: u8 = 2;
const STATE_DRAINING: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorState {
    Bootstrapping,
    Serving,
    Renewing,
    Draining,
}

impl CoordinatorState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_BOOTSTRAPPING => Self::Bootstrapping,
            STATE_SERVING => Self::Serving,
            STATE_RENEWING => Self::Renewing,
            _ => Self::Draining,
        }
    }
}

/// Renewal timing and retry policy
#[derive(Debug, Clone)]
pub struct CoordinatorPolicy {
    /// Renew once `not-after - now` is within this window
    pub renewal_lead: Duration,
    pub check_interval: Duration,
    /// Load/generate/save attempts per convergence pass
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl CoordinatorPolicy {
    pub fn from_config(config: &RenewalConfig) -> Self {
        Self {
            renewal_lead: Duration::from_secs(u64::from(config.lead_days) * 86400),
            check_interval: Duration::from_secs(config.check_interval_secs),
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            backoff_max: Duration::from_millis(config.backoff_max_ms),
        }
    }
}

impl Default for CoordinatorPolicy {
    fn default() -> Self {
        Self::from_config(&RenewalConfig::default())
    }
}

/// How a convergence pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
    /// The active certificate already satisfied the identity
    Unchanged,
    /// A stored certificate was adopted at this revision
    Adopted(u64),
    /// This process generated and saved the certificate at this revision
    Generated(u64),
}

/// Snapshot of coordinator state for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub slot: String,
    pub state: CoordinatorState,
    pub revision: Option<u64>,
    pub generations: u64,
    pub swaps: u64,
    pub fingerprint: Option<String>,
    pub common_name: Option<String>,
    pub sans: Vec<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub written_by: Option<String>,
    pub required_sans: Vec<String>,
}

enum Install {
    Installed,
    AlreadyActive,
    Rejected,
}

/// Keeps one valid serving certificate active for this process
pub struct CertificateCoordinator {
    key: SlotKey,
    store: TieredCertStore,
    factory: CertificateFactory,
    policy: CoordinatorPolicy,
    identity: RwLock<RequiredIdentity>,
    sni_filter: Option<SniFilter>,
    active: ArcSwapOption<StorageSlot>,
    renew_lock: Mutex<()>,
    state: AtomicU8,
    generations: AtomicU64,
    swaps: AtomicU64,
    learned_sans: AtomicUsize,
    learn_limit_reached: AtomicBool,
    check_requested: Notify,
    shutdown: CancellationToken,
}

impl CertificateCoordinator {
    pub fn new(
        key: SlotKey,
        store: TieredCertStore,
        factory: CertificateFactory,
        identity: RequiredIdentity,
        policy: CoordinatorPolicy,
    ) -> Self {
        debug!(
            slot = %key,
            sans = %identity.sans,
            renewal_lead_days = policy.renewal_lead.as_secs() / 86400,
            "Creating certificate coordinator"
        );

        Self {
            key,
            store,
            factory,
            policy,
            identity: RwLock::new(identity),
            sni_filter: None,
            active: ArcSwapOption::empty(),
            renew_lock: Mutex::new(()),
            state: AtomicU8::new(STATE_BOOTSTRAPPING),
            generations: AtomicU64::new(0),
            swaps: AtomicU64::new(0),
            learned_sans: AtomicUsize::new(0),
            learn_limit_reached: AtomicBool::new(false),
            check_requested: Notify::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Learn SANs from ClientHello server names accepted by `filter`
    pub fn with_sni_learning(mut self, filter: Option<SniFilter>) -> Self {
        self.sni_filter = filter;
        self
    }

    pub fn slot_key(&self) -> &SlotKey {
        &self.key
    }

    pub fn store(&self) -> &TieredCertStore {
        &self.store
    }

    pub fn factory(&self) -> &CertificateFactory {
        &self.factory
    }

    pub fn state(&self) -> CoordinatorState {
        CoordinatorState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_draining(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_DRAINING
    }

    pub fn required_identity(&self) -> RequiredIdentity {
        self.identity.read().clone()
    }

    pub fn active_slot(&self) -> Option<Arc<StorageSlot>> {
        self.active.load_full()
    }

    /// Certificate for the next handshake.
    ///
    /// Lock-free; called from the rustls resolver on every handshake.
    pub fn current_certified_key(&self) -> Option<Arc<CertifiedKey>> {
        self.active
            .load()
            .as_ref()
            .map(|slot| slot.record.certified_key())
    }

    pub fn stats(&self) -> CoordinatorStats {
        let active = self.active.load_full();
        let record = active.as_ref().map(|slot| &slot.record);

        CoordinatorStats {
            slot: self.key.to_string(),
            state: self.state(),
            revision: active.as_ref().map(|slot| slot.revision),
            generations: self.generations.load(Ordering::Relaxed),
            swaps: self.swaps.load(Ordering::Relaxed),
            fingerprint: record.map(|r| r.fingerprint().to_string()),
            common_name: record.and_then(|r| r.common_name().map(str::to_string)),
            sans: record.map(|r| r.sans().to_vec()).unwrap_or_default(),
            not_before: record.map(|r| r.not_before()),
            not_after: record.map(|r| r.not_after()),
            written_by: active.as_ref().map(|slot| slot.written_by.to_string()),
            required_sans: self.identity.read().sans.to_vec(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Obtain the first valid certificate: adopt a stored one or generate,
    /// persist and reconcile.
    pub async fn bootstrap(&self) -> Result<Convergence, CoordinatorError> {
        let _guard = self.renew_lock.lock().await;

        info!(
            slot = %self.key,
            sans = %self.identity.read().sans,
            "Bootstrapping serving certificate"
        );

        match self.converge().await {
            Ok(outcome) => {
                self.set_state(STATE_SERVING);
                info!(slot = %self.key, outcome = ?outcome, "Serving certificate ready");
                Ok(outcome)
            }
            Err(CoordinatorError::RenewalFailed {
                attempts,
                last_error,
            }) => Err(CoordinatorError::BootstrapFailed {
                attempts,
                last_error,
            }),
            Err(e) => Err(e),
        }
    }

    /// Re-validate the active certificate against the live identity and
    /// renew when it no longer satisfies it.
    pub async fn check(&self) -> Result<Convergence, CoordinatorError> {
        if self.is_draining() {
            return Err(CoordinatorError::Draining);
        }
        let _guard = self.renew_lock.lock().await;

        if let Some(active) = self.active.load_full() {
            let identity = self.identity.read().clone();
            let validation = self.factory.validate(
                &active.record,
                &identity,
                Utc::now(),
                self.policy.renewal_lead,
            );

            if validation.is_ok() {
                debug!(
                    slot = %self.key,
                    revision = active.revision,
                    not_after = %active.record.not_after(),
                    "Serving certificate is valid"
                );
                return Ok(Convergence::Unchanged);
            }

            log_needs_renewal(&self.key, active.revision, &validation);
        }

        self.renew().await
    }

    /// Handle a slot observed on the durable watch
    pub async fn observe(&self, slot: StorageSlot) -> Result<Convergence, CoordinatorError> {
        if self.is_draining() {
            return Err(CoordinatorError::Draining);
        }
        if slot.revision <= self.active_revision() {
            trace!(revision = slot.revision, "Ignoring already-known revision");
            return Ok(Convergence::Unchanged);
        }

        let _guard = self.renew_lock.lock().await;
        if slot.revision <= self.active_revision() {
            return Ok(Convergence::Unchanged);
        }

        let identity = self.identity.read().clone();
        let validation =
            self.factory
                .validate(&slot.record, &identity, Utc::now(), self.policy.renewal_lead);

        if validation.is_ok() {
            self.set_state(STATE_RENEWING);
            let installed = self.install(&slot);
            self.set_state(STATE_SERVING);
            if matches!(installed, Install::Installed) {
                return Ok(Convergence::Adopted(slot.revision));
            }
        } else {
            info!(
                slot = %self.key,
                revision = slot.revision,
                written_by = %slot.written_by,
                reason = validation.as_str(),
                "Peer certificate does not satisfy local identity"
            );
        }

        self.renew().await
    }

    /// Grow the required identity; applied by the next periodic check
    pub fn update_required_identity(&self, newer: &RequiredIdentity) -> bool {
        let mut identity = self.identity.write();
        let changed = identity.grow(newer);
        if changed {
            info!(
                slot = %self.key,
                common_name = %identity.common_name,
                sans = %identity.sans,
                "Required identity updated"
            );
        }
        changed
    }

    /// Offer a ClientHello server name for SNI learning
    pub fn observe_server_name(&self, server_name: &str) {
        let Some(filter) = &self.sni_filter else {
            return;
        };
        let Some(name) = SanSet::normalize(server_name) else {
            return;
        };
        if self.identity.read().sans.contains(&name) {
            return;
        }
        if !filter.accepts(&name) {
            trace!(server_name = %name, "Server name rejected by SNI filter");
            return;
        }

        let mut identity = self.identity.write();
        if identity.sans.contains(&name) {
            return;
        }
        if self.learned_sans.load(Ordering::Relaxed) >= filter.max_learned() {
            if !self.learn_limit_reached.swap(true, Ordering::Relaxed) {
                warn!(
                    server_name = %name,
                    max_learned_sans = filter.max_learned(),
                    "SNI learning limit reached, no further server names will be learned"
                );
            }
            return;
        }

        if identity.sans.insert(&name) {
            self.learned_sans.fetch_add(1, Ordering::Relaxed);
            info!(server_name = %name, "Learned server name from client hello");
        }
    }

    /// Ask the periodic task for an immediate re-validation
    pub fn request_check(&self) {
        debug!(slot = %self.key, "Certificate re-validation requested");
        self.check_requested.notify_one();
    }

    /// Stop background work; no further swaps happen after this
    pub fn drain(&self) {
        if self.state.swap(STATE_DRAINING, Ordering::AcqRel) != STATE_DRAINING {
            info!(slot = %self.key, "Certificate coordinator draining");
        }
        self.shutdown.cancel();
    }

    /// Spawn the periodic re-validation and durable watch tasks
    pub fn spawn_background(self: &Arc<Self>) -> CoordinatorTasks {
        let periodic = tokio::spawn(Arc::clone(self).run_periodic());
        let watch = tokio::spawn(Arc::clone(self).run_watch());
        CoordinatorTasks { periodic, watch }
    }

    async fn run_periodic(self: Arc<Self>) {
        let period = self.policy.check_interval.max(Duration::from_millis(10));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            check_interval_secs = period.as_secs(),
            "Starting certificate re-validation task"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    debug!("Running scheduled certificate check");
                }
                _ = self.check_requested.notified() => {
                    info!("Running requested certificate check");
                }
            }

            match self.check().await {
                Ok(Convergence::Unchanged) => {}
                Ok(outcome) => {
                    info!(outcome = ?outcome, "Certificate check replaced the serving certificate");
                }
                Err(CoordinatorError::Draining) => break,
                Err(e) => {
                    error!(
                        slot = %self.key,
                        error = %e,
                        "Certificate renewal failed, keeping the active certificate"
                    );
                }
            }
        }

        debug!("Certificate re-validation task stopped");
    }

    async fn run_watch(self: Arc<Self>) {
        let mut changes = self.store.watch(&self.key);
        info!(slot = %self.key, "Watching durable tier for certificate updates");

        loop {
            let slot = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = changes.next() => match next {
                    Some(slot) => slot,
                    None => break,
                },
            };

            match self.observe(slot).await {
                Ok(Convergence::Unchanged) => {}
                Ok(outcome) => {
                    info!(outcome = ?outcome, "Applied durable tier update");
                }
                Err(CoordinatorError::Draining) => break,
                Err(e) => {
                    error!(
                        slot = %self.key,
                        error = %e,
                        "Failed to reconcile durable tier update"
                    );
                }
            }
        }

        debug!("Durable watch task stopped");
    }

    // =========================================================================
    // Convergence
    // =========================================================================

    /// Must be called with `renew_lock` held
    async fn renew(&self) -> Result<Convergence, CoordinatorError> {
        self.set_state(STATE_RENEWING);
        let result = self.converge().await;
        self.set_state(STATE_SERVING);
        result
    }

    /// Must be called with `renew_lock` held
    async fn converge(&self) -> Result<Convergence, CoordinatorError> {
        let mut backoff = Backoff::new(self.policy.backoff_base, self.policy.backoff_max);
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.policy.max_attempts {
            if attempt > 1 {
                self.pause(&mut backoff).await?;
            }

            let identity = self.identity.read().clone();
            let now = Utc::now();

            let mut expected_revision = 0;
            let existing = match self.current_slot(&identity, now, attempt == 1).await {
                Ok(slot) => slot,
                Err(StoreError::CorruptSlot {
                    revision, reason, ..
                }) => {
                    warn!(
                        slot = %self.key,
                        revision,
                        reason = %reason,
                        "Durable slot is corrupt, replacing it"
                    );
                    expected_revision = revision;
                    None
                }
                Err(e) => {
                    warn!(slot = %self.key, attempt, error = %e, "Failed to load certificate slot");
                    last_error = e.to_string();
                    continue;
                }
            };

            if let Some(slot) = &existing {
                expected_revision = slot.revision;
                let validation =
                    self.factory
                        .validate(&slot.record, &identity, now, self.policy.renewal_lead);

                if validation.is_ok() {
                    match self.install(slot) {
                        Install::Installed => return Ok(Convergence::Adopted(slot.revision)),
                        Install::AlreadyActive => return Ok(Convergence::Unchanged),
                        Install::Rejected => {}
                    }
                } else {
                    debug!(
                        slot = %self.key,
                        revision = slot.revision,
                        reason = validation.as_str(),
                        "Stored certificate needs replacing"
                    );
                }
            }

            if self.is_draining() {
                return Err(CoordinatorError::Draining);
            }

            // Union, never drop: keep every name already served
            let mut sans = identity.sans.clone();
            if let Some(slot) = &existing {
                sans.extend_from(slot.record.sans());
            }
            let active = self.active.load_full();
            if let Some(active) = &active {
                sans.extend_from(active.record.sans());
            }

            // Never expire before the active certificate, or it could not be swapped in
            let min_not_after = active.as_ref().map(|slot| slot.record.not_after());
            let candidate = self
                .factory
                .generate_leaf_until(&identity.with_sans(sans), min_not_after)?;
            self.generations.fetch_add(1, Ordering::Relaxed);

            match self
                .store
                .save(&self.key, Arc::new(candidate), expected_revision)
                .await
            {
                Ok(SaveOutcome::Saved(slot)) => {
                    if matches!(self.install(&slot), Install::Installed) {
                        return Ok(Convergence::Generated(slot.revision));
                    }
                    if self.is_draining() {
                        return Err(CoordinatorError::Draining);
                    }
                    error!(
                        slot = %self.key,
                        revision = slot.revision,
                        "Saved certificate could not be activated"
                    );
                    return Err(CoordinatorError::RenewalFailed {
                        attempts: attempt,
                        last_error: format!(
                            "saved revision {} could not be activated",
                            slot.revision
                        ),
                    });
                }
                Ok(SaveOutcome::Conflict { current_revision }) => {
                    debug!(
                        slot = %self.key,
                        attempt,
                        expected_revision,
                        current_revision,
                        "Lost certificate race, re-reading the winner"
                    );
                    last_error = format!(
                        "conflict: expected revision {}, found {}",
                        expected_revision, current_revision
                    );
                }
                Err(e) => {
                    warn!(slot = %self.key, attempt, error = %e, "Failed to save certificate");
                    last_error = e.to_string();
                }
            }
        }

        Err(CoordinatorError::RenewalFailed {
            attempts: self.policy.max_attempts,
            last_error,
        })
    }

    /// The slot to reconcile against.
    ///
    /// The first attempt reads through the caches; a cached record that does
    /// not validate is re-checked against the durable tier, which always
    /// wins. Later attempts (after a conflict) go straight to durable.
    async fn current_slot(
        &self,
        identity: &RequiredIdentity,
        now: DateTime<Utc>,
        first_attempt: bool,
    ) -> Result<Option<StorageSlot>, StoreError> {
        if first_attempt {
            let Some(loaded) = self.store.load(&self.key).await? else {
                return Ok(None);
            };

            if loaded.tier == Tier::Durable {
                return Ok(Some(loaded.slot));
            }

            let validation = self.factory.validate(
                &loaded.slot.record,
                identity,
                now,
                self.policy.renewal_lead,
            );
            if validation.is_ok() {
                trace!(tier = %loaded.tier, revision = loaded.slot.revision, "Using cached certificate");
                return Ok(Some(loaded.slot));
            }

            debug!(
                tier = %loaded.tier,
                revision = loaded.slot.revision,
                reason = validation.as_str(),
                "Cached certificate unusable, consulting durable tier"
            );
        }

        self.store.load_durable(&self.key).await
    }

    /// Make `slot` the active certificate if it moves strictly forward:
    /// higher revision, no earlier expiry, no fewer SANs.
    fn install(&self, slot: &StorageSlot) -> Install {
        if self.is_draining() {
            return Install::Rejected;
        }

        if let Some(current) = self.active.load().as_ref() {
            if slot.revision == current.revision {
                return Install::AlreadyActive;
            }
            if slot.revision < current.revision
                || slot.record.not_after() < current.record.not_after()
                || !slot.record.sans().is_superset(current.record.sans())
            {
                debug!(
                    revision = slot.revision,
                    active_revision = current.revision,
                    "Refusing to activate a certificate that moves backwards"
                );
                return Install::Rejected;
            }
        }

        self.active.store(Some(Arc::new(slot.clone())));
        self.swaps.fetch_add(1, Ordering::Relaxed);

        info!(
            slot = %self.key,
            revision = slot.revision,
            fingerprint = %slot.record.fingerprint(),
            not_after = %slot.record.not_after(),
            sans = %slot.record.sans(),
            written_by = %slot.written_by,
            "Activated serving certificate"
        );
        Install::Installed
    }

    async fn pause(&self, backoff: &mut Backoff) -> Result<(), CoordinatorError> {
        let delay = backoff.next_delay();
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(CoordinatorError::Draining),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn active_revision(&self) -> u64 {
        self.active.load().as_ref().map_or(0, |slot| slot.revision)
    }

    fn set_state(&self, state: u8) {
        // Draining is terminal
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != STATE_DRAINING).then_some(state)
            });
    }
}

impl std::fmt::Debug for CertificateCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateCoordinator")
            .field("slot", &self.key)
            .field("state", &self.state())
            .field("revision", &self.active_revision())
            .finish_non_exhaustive()
    }
}

fn log_needs_renewal(key: &SlotKey, revision: u64, validation: &Validation) {
    match validation {
        Validation::MissingSans(missing) => info!(
            slot = %key,
            revision,
            missing = %missing,
            "Serving certificate is missing required SANs"
        ),
        other => info!(
            slot = %key,
            revision,
            reason = other.as_str(),
            "Serving certificate needs renewal"
        ),
    }
}

/// Handles to the coordinator's background tasks
#[derive(Debug)]
pub struct CoordinatorTasks {
    periodic: JoinHandle<()>,
    watch: JoinHandle<()>,
}

impl CoordinatorTasks {
    /// Wait for the tasks to stop after [`CertificateCoordinator::drain`],
    /// aborting whatever is still running at the deadline.
    pub async fn join(self, timeout: Duration) {
        let deadline = Instant::now() + timeout;

        for (name, handle) in [("periodic", self.periodic), ("watch", self.watch)] {
            let abort = handle.abort_handle();
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => debug!(task = name, "Background task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "Background task failed"),
                Err(_) => {
                    warn!(task = name, "Background task did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
    }
}
