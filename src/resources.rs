use crate::dns;
use k8s_openapi::api::core::v1::{
    Node,
    PodTemplateSpec,
};
use kube::{
    api::ObjectMeta,
    CustomResource,
};
use schemars::JsonSchema;
use serde::{
    Deserialize,
    Serialize,
};

pub const ANNOTATION_PREFIX: &str = "agones-mc";
/// Requests DNS records under the given domain. May also be set as a label,
/// which is the usual form for Nodes.
pub const DOMAIN_ANNOTATION: &str = "agones-mc/domain";
/// Set by the reconciler to the canonical A record name once records exist.
pub const EXTERNAL_DNS_ANNOTATION: &str = "agones-mc/externalDNS";
/// Overrides the subdomain used for the public hostname.
pub const SUBDOMAIN_ANNOTATION: &str = "agones-mc/customSubdomain";
/// Blocks deletion until the reconciler has removed the provider records.
pub const DNS_FINALIZER: &str = "agones-mc/externalDNS";

pub const USER_ID_LABEL: &str = "userId";
pub const EDITION_LABEL: &str = "edition";
pub const UUID_LABEL: &str = "uuid";

/// The slice of the Agones GameServer resource this crate consumes. The CRD
/// itself is owned and installed by Agones; we only read status and tag
/// metadata.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "agones.dev",
    version = "v1",
    kind = "GameServer",
    namespaced,
    status = "GameServerStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<GameServerPort>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<Health>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerPort {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_seconds: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_threshold: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GameServerStatus {
    #[serde(default)]
    pub state: GameServerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<GameServerStatusPort>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct GameServerStatusPort {
    pub name: String,
    pub port: i32,
}

/// Agones GameServer lifecycle states. Mutated only by the Agones controller.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum GameServerState {
    #[default]
    PortAllocation,
    Creating,
    Starting,
    Scheduled,
    RequestReady,
    Ready,
    Allocated,
    Shutdown,
    Error,
}

/// Minecraft server edition, carried as the `edition` label and registry column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edition {
    Java,
    Bedrock,
}

impl Edition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Edition::Java => "java",
            Edition::Bedrock => "bedrock",
        }
    }
}

impl std::fmt::Display for Edition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for Edition {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "java" => Ok(Edition::Java),
            "bedrock" => Ok(Edition::Bedrock),
            other => Err(format!("unknown edition: {other:?}")),
        }
    }
}

impl GameServer {
    pub fn user_id(&self) -> Option<&str> {
        self.metadata.labels.as_ref()?.get(USER_ID_LABEL).map(String::as_str)
    }

    pub fn edition(&self) -> Option<Edition> {
        let label = self.metadata.labels.as_ref()?.get(EDITION_LABEL)?;
        Edition::try_from(label.clone()).ok()
    }

    pub fn address(&self) -> Option<&str> {
        self.status
            .as_ref()?
            .address
            .as_deref()
            .filter(|addr| !addr.is_empty())
    }

    pub fn allocated_port(&self) -> Option<i32> {
        self.status.as_ref()?.ports.as_ref()?.first().map(|port| port.port)
    }

    pub fn node_name(&self) -> Option<&str> {
        self.status.as_ref()?.node_name.as_deref()
    }

    pub fn custom_subdomain(&self) -> Option<&str> {
        get_annotation(&self.metadata, SUBDOMAIN_ANNOTATION)
    }

    /// Public hostname `<custom subdomain | resource name>.<domain>`, without
    /// trailing dot. None when no domain is requested.
    pub fn hostname(&self) -> Option<String> {
        let domain = domain_of(&self.metadata)?;
        let subdomain = self
            .custom_subdomain()
            .map(String::from)
            .or_else(|| self.metadata.name.clone())?;
        Some(format!("{subdomain}.{}", domain.trim_end_matches('.')))
    }

    pub fn is_before_pod_created(&self) -> bool {
        matches!(
            self.state(),
            GameServerState::PortAllocation | GameServerState::Creating | GameServerState::Starting
        )
    }

    pub fn is_starting(&self) -> bool {
        self.is_before_pod_created()
            || matches!(self.state(), GameServerState::Scheduled | GameServerState::RequestReady)
    }

    pub fn is_online(&self) -> bool {
        matches!(self.state(), GameServerState::Ready | GameServerState::Allocated)
    }

    fn state(&self) -> GameServerState {
        self.status.as_ref().map(|status| status.state).unwrap_or_default()
    }
}

/// First ExternalIP address of a node.
pub fn node_external_ip(node: &Node) -> Option<&str> {
    node.status
        .as_ref()?
        .addresses
        .as_ref()?
        .iter()
        .find(|addr| addr.type_ == "ExternalIP")
        .map(|addr| addr.address.as_str())
}

/// Requested domain, read from the `agones-mc/domain` annotation first and the
/// label as a fallback, canonicalized with a trailing dot. Invalid DNS names
/// are treated as absent.
pub fn domain_of(meta: &ObjectMeta) -> Option<String> {
    let domain = get_annotation(meta, DOMAIN_ANNOTATION).or_else(|| get_label(meta, DOMAIN_ANNOTATION))?;
    dns::is_dns_name(domain).then(|| dns::ensure_trailing_dot(domain))
}

pub fn external_dns_of(meta: &ObjectMeta) -> Option<&str> {
    get_annotation(meta, EXTERNAL_DNS_ANNOTATION)
}

pub fn set_external_dns(meta: &mut ObjectMeta, record_name: &str) {
    meta.annotations
        .get_or_insert_with(Default::default)
        .insert(EXTERNAL_DNS_ANNOTATION.to_string(), dns::ensure_trailing_dot(record_name));
}

pub fn has_finalizer(meta: &ObjectMeta) -> bool {
    meta.finalizers
        .as_ref()
        .map_or(false, |finalizers| finalizers.iter().any(|f| f == DNS_FINALIZER))
}

pub fn set_finalizer(meta: &mut ObjectMeta) {
    let finalizers = meta.finalizers.get_or_insert_with(Vec::new);
    if !finalizers.iter().any(|f| f == DNS_FINALIZER) {
        finalizers.push(DNS_FINALIZER.to_string());
    }
}

pub fn remove_finalizer(meta: &mut ObjectMeta) {
    if let Some(finalizers) = meta.finalizers.as_mut() {
        finalizers.retain(|f| f != DNS_FINALIZER);
    }
}

fn get_annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()?
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.trim().is_empty())
}

fn get_label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels
        .as_ref()?
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.trim().is_empty())
}
