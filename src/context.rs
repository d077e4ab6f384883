use crate::dns::provider::DnsClient;
use std::sync::Arc;

/// Everything a reconcile needs, constructed once in main and shared by Arc.
pub struct Context {
    pub client: kube::Client,
    pub namespace: String,
    pub dns: Arc<dyn DnsClient>,
}
