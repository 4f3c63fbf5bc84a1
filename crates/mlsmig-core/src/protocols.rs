//! Which protocols the self user advertises to other users.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::model::{ClientId, MigrationPolicy, SelfClient, SupportedProtocol};

/// Inputs of [`self_supported_protocols`].
#[derive(Debug, Clone, Copy)]
pub struct SupportedProtocolsInput<'a> {
    /// Protocols the team allows.
    pub team_protocols: &'a BTreeSet<SupportedProtocol>,
    /// Cached migration window.
    pub policy: &'a MigrationPolicy,
    /// Every client of the self user.
    pub self_clients: &'a [SelfClient],
    /// This device's client.
    pub current_client: &'a ClientId,
    /// Whether this device already registered an MLS client locally.
    ///
    /// Covers the window after first login where the backend does not yet
    /// report the new client as MLS capable.
    pub has_registered_mls_client: bool,
}

/// Computes the protocols the self user supports at `now`.
///
/// Proteus stays supported until the migration window closes unless the team
/// keeps allowing it. MLS requires team support plus one of: the window has
/// closed, every active client (and this one) is MLS capable, or this device
/// registered an MLS client.
#[must_use]
pub fn self_supported_protocols(
    input: SupportedProtocolsInput<'_>,
    now: DateTime<Utc>,
) -> BTreeSet<SupportedProtocol> {
    let migration_ended = input.policy.has_ended(now);

    let mut protocols = BTreeSet::new();
    if input.team_protocols.contains(&SupportedProtocol::Proteus) || !migration_ended {
        protocols.insert(SupportedProtocol::Proteus);
    }

    // An empty client list counts as all capable.
    let all_clients_capable = input
        .self_clients
        .iter()
        .filter(|client| client.is_active || &client.id == input.current_client)
        .all(|client| client.is_mls_capable);
    let team_allows_mls = input.team_protocols.contains(&SupportedProtocol::Mls);
    debug!(
        team_allows_mls,
        migration_ended,
        all_clients_capable,
        has_registered_mls_client = input.has_registered_mls_client,
        "Evaluated MLS support"
    );
    if team_allows_mls
        && (migration_ended || all_clients_capable || input.has_registered_mls_client)
    {
        protocols.insert(SupportedProtocol::Mls);
    }
    protocols
}

/// Merges a freshly computed set with what is already advertised.
///
/// MLS is never withdrawn once advertised.
#[must_use]
pub fn advertised_protocols(
    computed: BTreeSet<SupportedProtocol>,
    previous: Option<&BTreeSet<SupportedProtocol>>,
) -> BTreeSet<SupportedProtocol> {
    let mut protocols = computed;
    if previous.is_some_and(|previous| previous.contains(&SupportedProtocol::Mls)) {
        protocols.insert(SupportedProtocol::Mls);
    }
    protocols
}
