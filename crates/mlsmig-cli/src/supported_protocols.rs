//! In-memory self user protocol advertisement.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mlsmig_core::model::{ClientId, SelfClient, SupportedProtocol};
use mlsmig_core::ports::{MlsClientState, SupportedProtocolsUpdater, UserConfigStore};
use mlsmig_core::protocols::{SupportedProtocolsInput, advertised_protocols, self_supported_protocols};
use mlsmig_core::{Clock, CoreFailure, MigrationPolicy, StorageError};
use tracing::{debug, info};

/// Recomputes the self user's supported protocols from the cached team
/// settings and keeps the result as the "published" set.
pub struct SelfProtocolsAdvertiser {
    user_config: Arc<dyn UserConfigStore>,
    client_state: Arc<dyn MlsClientState>,
    clock: Arc<dyn Clock>,
    self_clients: Vec<SelfClient>,
    current_client: ClientId,
    advertised: Mutex<Option<BTreeSet<SupportedProtocol>>>,
}

impl SelfProtocolsAdvertiser {
    pub fn new(
        user_config: Arc<dyn UserConfigStore>,
        client_state: Arc<dyn MlsClientState>,
        clock: Arc<dyn Clock>,
        self_clients: Vec<SelfClient>,
        current_client: ClientId,
    ) -> Self {
        Self {
            user_config,
            client_state,
            clock,
            self_clients,
            current_client,
            advertised: Mutex::new(None),
        }
    }

    /// The set last published, if any.
    pub fn advertised(&self) -> Option<BTreeSet<SupportedProtocol>> {
        self.advertised.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl SupportedProtocolsUpdater for SelfProtocolsAdvertiser {
    async fn update_supported_protocols(
        &self,
        synchronise_users: bool,
    ) -> Result<bool, CoreFailure> {
        let team_protocols = match self.user_config.supported_protocols().await {
            Ok(protocols) => protocols,
            Err(StorageError::NotFound { .. }) => {
                debug!("Team protocols not configured, skipping supported protocols update");
                return Ok(false);
            },
            Err(e) => return Err(e.into()),
        };
        let policy = match self.user_config.migration_policy().await {
            Ok(policy) => policy,
            Err(StorageError::NotFound { .. }) => MigrationPolicy::disabled(),
            Err(e) => return Err(e.into()),
        };
        let has_registered_mls_client = self.client_state.has_registered_mls_client().await?;

        let computed = self_supported_protocols(
            SupportedProtocolsInput {
                team_protocols: &team_protocols,
                policy: &policy,
                self_clients: &self.self_clients,
                current_client: &self.current_client,
                has_registered_mls_client,
            },
            self.clock.now(),
        );

        let mut advertised = self.advertised.lock().expect("lock poisoned");
        let next = advertised_protocols(computed, advertised.as_ref());
        if advertised.as_ref() == Some(&next) {
            return Ok(false);
        }
        info!(
            protocols = ?next,
            previous = ?*advertised,
            synchronise_users,
            "Updated self supported protocols"
        );
        *advertised = Some(next);
        Ok(true)
    }
}
