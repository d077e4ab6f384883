use crate::resources::GameServer;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use thiserror::Error;

/// Errors surfaced by a DNS provider.
///
/// `RecordExists` and `RecordsNonExistent` are the idempotency signals the
/// reconciler classifies as success via [`ignore_already_exists`] and
/// [`ignore_client_error`]; everything else is transient and propagates so the
/// controller requeues with backoff.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("record for {record} already exists")]
    RecordExists { record: String },

    #[error("records for {records:?} non existent")]
    RecordsNonExistent { records: Vec<String> },

    #[error("dns api error: status={status}, message={message}")]
    Api { status: u16, message: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The watcher's event filter keeps unallocated objects away from record
    /// creation. On teardown this can still surface when an address or port
    /// was deallocated before deletion; [`ignore_client_error`] classifies
    /// that as success so the finalizer is released.
    #[error("server address and ports not allocated")]
    NotAllocated,
}

/// Idempotent external-DNS operations for the two watched kinds. A and SRV
/// records for one resource are always submitted as a single atomic change,
/// never one at a time.
#[async_trait]
pub trait DnsClient: Send + Sync {
    /// Create the A+SRV record pair for an allocated GameServer.
    async fn set_game_server_external_dns(&self, domain: &str, gs: &GameServer) -> Result<(), ProviderError>;

    /// Delete the A+SRV record pair for a GameServer.
    async fn remove_game_server_external_dns(&self, domain: &str, gs: &GameServer) -> Result<(), ProviderError>;

    /// Create the A record for a node's external IP.
    async fn set_node_external_dns(&self, domain: &str, node: &Node) -> Result<(), ProviderError>;

    /// Delete the A record for a node.
    async fn remove_node_external_dns(&self, domain: &str, node: &Node) -> Result<(), ProviderError>;
}

/// Classify already-exists conflicts on create as success.
pub fn ignore_already_exists(result: Result<(), ProviderError>) -> Result<(), ProviderError> {
    match result {
        Err(ProviderError::RecordExists { record }) => {
            debug!(%record, "records already exist, treating as provisioned");
            Ok(())
        }
        other => other,
    }
}

/// Classify missing records on delete as success. An object that lost its
/// allocation before deletion has no addressable records left either, so
/// that is removal-complete as well.
pub fn ignore_client_error(result: Result<(), ProviderError>) -> Result<(), ProviderError> {
    match result {
        Err(ProviderError::RecordsNonExistent { records }) => {
            debug!(?records, "records already gone, treating as removed");
            Ok(())
        }
        Err(ProviderError::NotAllocated) => {
            warn!("object no longer allocated, skipping record removal");
            Ok(())
        }
        other => other,
    }
}
