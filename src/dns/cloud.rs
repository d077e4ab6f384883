use super::{
    join_a_record_name,
    join_srv_record_name,
    join_srv_rr,
    provider::{
        DnsClient,
        ProviderError,
    },
};
use crate::resources::{
    self,
    GameServer,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use reqwest::StatusCode;
use serde::{
    Deserialize,
    Serialize,
};
use std::time::Duration;

pub const DEFAULT_TTL: i64 = 60 * 30;
pub const DEFAULT_PRIORITY: u16 = 0;
pub const DEFAULT_WEIGHT: u16 = 0;

const DEFAULT_ENDPOINT: &str = "https://dns.googleapis.com/dns/v1";

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    SRV,
}

/// One resource record set in the managed zone.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ResourceRecordSet {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    pub ttl: i64,
    pub rrdatas: Vec<String>,
}

/// An atomic batched change against the zone.
///
/// See https://cloud.google.com/dns/docs/reference/rest/v1/changes.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Change {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additions: Vec<ResourceRecordSet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deletions: Vec<ResourceRecordSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// A+SRV pair for an allocated GameServer. The A record resolves the server's
/// own name to its allocated address; the SRV entry points minecraft clients
/// at the hosting node's A record with the allocated port.
pub fn game_server_record_sets(
    domain: &str,
    gs: &GameServer,
) -> Result<(ResourceRecordSet, ResourceRecordSet), ProviderError> {
    let name = gs.name_any();
    let address = gs.address().ok_or(ProviderError::NotAllocated)?;
    let port = gs.allocated_port().ok_or(ProviderError::NotAllocated)?;
    let node_name = gs.node_name().ok_or(ProviderError::NotAllocated)?;

    let a = ResourceRecordSet {
        name: join_a_record_name(domain, &name),
        record_type: RecordType::A,
        ttl: DEFAULT_TTL,
        rrdatas: vec![address.to_string()],
    };
    let target = join_a_record_name(domain, node_name);
    let srv = ResourceRecordSet {
        name: join_srv_record_name(domain, &name),
        record_type: RecordType::SRV,
        ttl: DEFAULT_TTL,
        rrdatas: vec![join_srv_rr(DEFAULT_PRIORITY, DEFAULT_WEIGHT, port, &target)],
    };
    Ok((a, srv))
}

/// A record for a node's external IP.
pub fn node_record_set(domain: &str, node: &Node) -> Result<ResourceRecordSet, ProviderError> {
    let external_ip = resources::node_external_ip(node).ok_or(ProviderError::NotAllocated)?;
    Ok(ResourceRecordSet {
        name: join_a_record_name(domain, &node.name_any()),
        record_type: RecordType::A,
        ttl: DEFAULT_TTL,
        rrdatas: vec![external_ip.to_string()],
    })
}

/// Cloud DNS client submitting batched record changes to a managed zone.
pub struct CloudDnsApi {
    http: reqwest::Client,
    endpoint: String,
    project_id: String,
    managed_zone: String,
    api_token: String,
}

impl CloudDnsApi {
    pub fn new(project_id: impl ToString, managed_zone: impl ToString, api_token: impl ToString) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            project_id: project_id.to_string(),
            managed_zone: managed_zone.to_string(),
            api_token: api_token.to_string(),
        }
    }

    /// Request timeout for every change submission.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http = reqwest::Client::builder().timeout(timeout).build().expect("reqwest client");
        self
    }

    /// Override the API endpoint, used to point tests at a local server.
    pub fn with_endpoint(mut self, endpoint: impl ToString) -> Self {
        self.endpoint = endpoint.to_string().trim_end_matches('/').to_string();
        self
    }

    async fn submit(&self, change: &Change) -> Result<Change, ProviderError> {
        let url = format!(
            "{}/projects/{}/managedZones/{}/changes",
            self.endpoint, self.project_id, self.managed_zone
        );

        let res = self
            .http
            .post(&url)
            .bearer_auth(&self.api_token)
            .header("Content-Type", "application/json")
            .json(change)
            .send()
            .await?;

        let status = res.status();
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: res.text().await.unwrap_or_default(),
            });
        }

        Ok(res.json().await?)
    }
}

#[async_trait]
impl DnsClient for CloudDnsApi {
    async fn set_game_server_external_dns(&self, domain: &str, gs: &GameServer) -> Result<(), ProviderError> {
        let (a, srv) = game_server_record_sets(domain, gs)?;
        let record = a.name.clone();
        let change = Change {
            additions: vec![a, srv],
            ..Default::default()
        };

        match self.submit(&change).await {
            Ok(_) => {
                info!(%record, "created gameserver record pair");
                Ok(())
            }
            Err(ProviderError::Api { status, .. })
                if status == StatusCode::CONFLICT.as_u16() || status == StatusCode::NOT_MODIFIED.as_u16() =>
            {
                Err(ProviderError::RecordExists { record })
            }
            Err(err) => Err(err),
        }
    }

    async fn remove_game_server_external_dns(&self, domain: &str, gs: &GameServer) -> Result<(), ProviderError> {
        let (a, srv) = game_server_record_sets(domain, gs)?;
        let records = vec![a.name.clone(), srv.name.clone()];
        let change = Change {
            deletions: vec![srv, a],
            ..Default::default()
        };

        match self.submit(&change).await {
            Ok(_) => {
                info!(?records, "removed gameserver record pair");
                Ok(())
            }
            Err(ProviderError::Api { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Err(ProviderError::RecordsNonExistent { records })
            }
            Err(err) => Err(err),
        }
    }

    async fn set_node_external_dns(&self, domain: &str, node: &Node) -> Result<(), ProviderError> {
        let a = node_record_set(domain, node)?;
        let record = a.name.clone();
        let change = Change {
            additions: vec![a],
            ..Default::default()
        };

        match self.submit(&change).await {
            Ok(_) => {
                info!(%record, "created node record");
                Ok(())
            }
            Err(ProviderError::Api { status, .. })
                if status == StatusCode::CONFLICT.as_u16() || status == StatusCode::NOT_MODIFIED.as_u16() =>
            {
                Err(ProviderError::RecordExists { record })
            }
            Err(err) => Err(err),
        }
    }

    async fn remove_node_external_dns(&self, domain: &str, node: &Node) -> Result<(), ProviderError> {
        let a = node_record_set(domain, node)?;
        let records = vec![a.name.clone()];
        let change = Change {
            deletions: vec![a],
            ..Default::default()
        };

        match self.submit(&change).await {
            Ok(_) => {
                info!(?records, "removed node record");
                Ok(())
            }
            Err(ProviderError::Api { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Err(ProviderError::RecordsNonExistent { records })
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{
        GameServerSpec,
        GameServerStatus,
        GameServerStatusPort,
    };
    use kube::api::ObjectMeta;

    fn allocated_game_server() -> GameServer {
        GameServer {
            metadata: ObjectMeta {
                name: Some("mc-server".to_string()),
                ..Default::default()
            },
            spec: GameServerSpec::default(),
            status: Some(GameServerStatus {
                address: Some("35.0.0.1".to_string()),
                ports: Some(vec![GameServerStatusPort {
                    name: "mc".to_string(),
                    port: 7000,
                }]),
                node_name: Some("mc-node".to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn gameserver_record_pair_values() {
        let (a, srv) = game_server_record_sets("example.com", &allocated_game_server()).unwrap();

        assert_eq!(a.name, "mc-server.example.com.");
        assert_eq!(a.record_type, RecordType::A);
        assert_eq!(a.rrdatas, vec!["35.0.0.1".to_string()]);
        assert_eq!(a.ttl, 1800);

        assert_eq!(srv.name, "_minecraft._tcp.mc-server.example.com.");
        assert_eq!(srv.record_type, RecordType::SRV);
        assert_eq!(srv.rrdatas, vec!["0 0 7000 mc-node.example.com.".to_string()]);
    }

    #[test]
    fn unallocated_game_server_is_rejected() {
        let mut gs = allocated_game_server();
        gs.status = None;
        assert!(matches!(
            game_server_record_sets("example.com", &gs),
            Err(ProviderError::NotAllocated)
        ));
    }

    #[test]
    fn node_record_requires_external_ip() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("mc-node".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            node_record_set("example.com", &node),
            Err(ProviderError::NotAllocated)
        ));
    }
}
