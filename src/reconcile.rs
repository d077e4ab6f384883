use crate::{
    context::Context,
    dns::{
        self,
        provider::{
            self,
            DnsClient,
            ProviderError,
        },
    },
    resources::{
        self,
        GameServer,
    },
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{
        Api,
        PostParams,
    },
    runtime::controller::Action,
    Resource,
    ResourceExt,
};
use serde::{
    de::DeserializeOwned,
    Serialize,
};
use std::{
    sync::Arc,
    time::Duration,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// A watched kind the DNS reconciler can manage records for. Implemented by
/// adapters over the concrete resources rather than dispatching on runtime
/// types.
#[async_trait]
pub trait DnsRecordResource:
    Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + std::fmt::Debug + Send + Sync + 'static
{
    fn kind_name() -> &'static str;

    fn api(client: kube::Client, namespace: &str) -> Api<Self>;

    /// Domain requested via annotation/label, canonicalized.
    fn domain(&self) -> Option<String>;

    /// Address/port allocation gate; events failing this never reach the
    /// reconciler or the provider.
    fn dns_ready(&self) -> bool;

    async fn set_external_dns(&self, dns: &dyn DnsClient, domain: &str) -> Result<(), ProviderError>;

    async fn remove_external_dns(&self, dns: &dyn DnsClient, domain: &str) -> Result<(), ProviderError>;
}

#[async_trait]
impl DnsRecordResource for GameServer {
    fn kind_name() -> &'static str {
        "GameServer"
    }

    fn api(client: kube::Client, namespace: &str) -> Api<Self> {
        Api::namespaced(client, namespace)
    }

    fn domain(&self) -> Option<String> {
        resources::domain_of(&self.metadata)
    }

    fn dns_ready(&self) -> bool {
        self.address().is_some() && self.allocated_port().is_some()
    }

    async fn set_external_dns(&self, dns: &dyn DnsClient, domain: &str) -> Result<(), ProviderError> {
        dns.set_game_server_external_dns(domain, self).await
    }

    async fn remove_external_dns(&self, dns: &dyn DnsClient, domain: &str) -> Result<(), ProviderError> {
        dns.remove_game_server_external_dns(domain, self).await
    }
}

#[async_trait]
impl DnsRecordResource for Node {
    fn kind_name() -> &'static str {
        "Node"
    }

    fn api(client: kube::Client, _namespace: &str) -> Api<Self> {
        Api::all(client)
    }

    fn domain(&self) -> Option<String> {
        resources::domain_of(&self.metadata)
    }

    fn dns_ready(&self) -> bool {
        resources::node_external_ip(self).is_some()
    }

    async fn set_external_dns(&self, dns: &dyn DnsClient, domain: &str) -> Result<(), ProviderError> {
        dns.set_node_external_dns(domain, self).await
    }

    async fn remove_external_dns(&self, dns: &dyn DnsClient, domain: &str) -> Result<(), ProviderError> {
        dns.remove_node_external_dns(domain, self).await
    }
}

/// Where an object sits in the annotation/finalizer state machine, computed
/// once per reconcile and matched exhaustively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsState {
    /// No domain requested and no records held.
    Unmanaged,
    /// Domain requested, records not yet created.
    Provision { domain: String },
    /// Records exist and the object is not being deleted.
    Converged,
    /// Object deleting with records still held by the finalizer. The domain
    /// can be absent if someone stripped the annotation after provisioning;
    /// the finalizer must still be released.
    Teardown { domain: Option<String> },
}

impl DnsState {
    pub fn of<R: DnsRecordResource>(obj: &R) -> Self {
        let meta = obj.meta();
        let dns_exists = resources::external_dns_of(meta).is_some();
        let deleting = meta.deletion_timestamp.is_some();

        if deleting {
            // The finalizer is the source of truth for held records; it must
            // be released even if someone stripped the annotations.
            return if resources::has_finalizer(meta) {
                DnsState::Teardown { domain: obj.domain() }
            } else {
                DnsState::Converged
            };
        }

        match (dns_exists, obj.domain()) {
            (false, Some(domain)) => DnsState::Provision { domain },
            (false, None) => DnsState::Unmanaged,
            (true, _) => DnsState::Converged,
        }
    }
}

/// Level-triggered reconcile for one object. Re-running on an unchanged
/// object is a no-op: record idempotency is the provider's contract and the
/// annotation/finalizer write only happens on state transitions.
pub async fn reconcile_dns<R: DnsRecordResource>(obj: Arc<R>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let kind = R::kind_name();
    let name = obj.name_any();
    let api = R::api(ctx.client.clone(), &ctx.namespace);

    match DnsState::of(obj.as_ref()) {
        DnsState::Unmanaged => {
            debug!(kind, %name, "no domain requested, nothing to manage");
            Ok(Action::await_change())
        }
        DnsState::Converged => {
            debug!(kind, %name, "external dns already set");
            Ok(Action::await_change())
        }
        DnsState::Provision { domain } => {
            provider::ignore_already_exists(obj.set_external_dns(ctx.dns.as_ref(), &domain).await)?;

            // Fresh read so the annotation/finalizer write carries the latest
            // resource version.
            let Some(mut latest) = get_or_gone(&api, &name).await? else {
                info!(kind, %name, "object gone before records could be annotated");
                return Ok(Action::await_change());
            };
            let record = dns::join_a_record_name(&domain, &name);
            resources::set_external_dns(latest.meta_mut(), &record);
            resources::set_finalizer(latest.meta_mut());

            match api.replace(&name, &PostParams::default(), &latest).await {
                Ok(_) => {
                    info!(kind, %name, %record, "external dns set");
                    Ok(Action::await_change())
                }
                Err(kube::Error::Api(err)) if err.code == 409 => {
                    warn!(kind, %name, "conflict while annotating, requeueing for a fresh cycle");
                    Ok(Action::requeue(Duration::from_secs(1)))
                }
                Err(err) => Err(err.into()),
            }
        }
        DnsState::Teardown { domain } => {
            match domain {
                Some(domain) => {
                    provider::ignore_client_error(obj.remove_external_dns(ctx.dns.as_ref(), &domain).await)?;
                }
                None => {
                    warn!(kind, %name, "deleting object holds records but no domain annotation, releasing finalizer");
                }
            }

            let Some(mut latest) = get_or_gone(&api, &name).await? else {
                info!(kind, %name, "object gone during teardown");
                return Ok(Action::await_change());
            };
            resources::remove_finalizer(latest.meta_mut());

            match api.replace(&name, &PostParams::default(), &latest).await {
                Ok(_) => {
                    info!(kind, %name, "external dns records removed, finalizer released");
                    Ok(Action::await_change())
                }
                Err(kube::Error::Api(err)) if err.code == 409 => {
                    warn!(kind, %name, "conflict while releasing finalizer, requeueing for a fresh cycle");
                    Ok(Action::requeue(Duration::from_secs(1)))
                }
                Err(err) => Err(err.into()),
            }
        }
    }
}

pub fn error_policy<R: DnsRecordResource>(obj: Arc<R>, err: &ReconcileError, _ctx: Arc<Context>) -> Action {
    error!(kind = R::kind_name(), name = %obj.name_any(), "reconcile error: {err:?}");
    Action::requeue(Duration::from_secs(15))
}

/// NotFound between the event and the read is terminal, the object is gone.
async fn get_or_gone<R: DnsRecordResource>(api: &Api<R>, name: &str) -> Result<Option<R>, ReconcileError> {
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(None),
        Err(err) => Err(err.into()),
    }
}
