use agones_minecraft::{
    dns::{
        cloud::{
            Change,
            CloudDnsApi,
        },
        provider::{
            self,
            DnsClient,
            ProviderError,
        },
    },
    resources::{
        GameServer,
        GameServerSpec,
        GameServerStatus,
        GameServerStatusPort,
    },
};
use kube::api::ObjectMeta;
use serde_json::json;
use wiremock::{
    matchers::{
        header,
        method,
        path,
    },
    Mock,
    MockServer,
    ResponseTemplate,
};

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

fn client(server: &MockServer) -> CloudDnsApi {
    CloudDnsApi::new("test-project", "test-zone", "test-token").with_endpoint(server.uri())
}

const CHANGES_PATH: &str = "/projects/test-project/managedZones/test-zone/changes";

#[tokio::test]
async fn submits_a_and_srv_records_in_one_change() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHANGES_PATH))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "pending"})))
        .expect(1)
        .mount(&server)
        .await;

    client(&server)
        .set_game_server_external_dns("example.com", &allocated_game_server())
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let change: Change = serde_json::from_slice(&requests[0].body).unwrap();

    assert_eq!(change.additions.len(), 2);
    assert!(change.deletions.is_empty());
    assert_eq!(change.additions[0].name, "mc-server.example.com.");
    assert_eq!(change.additions[0].rrdatas, vec!["35.0.0.1".to_string()]);
    assert_eq!(change.additions[1].name, "_minecraft._tcp.mc-server.example.com.");
    assert_eq!(change.additions[1].rrdatas, vec!["0 0 7000 mc-node.example.com.".to_string()]);
    assert_eq!(change.additions[0].ttl, 1800);
}

#[tokio::test]
async fn conflict_on_create_classifies_as_record_exists() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHANGES_PATH))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let api = client(&server);
    let gs = allocated_game_server();

    let err = api.set_game_server_external_dns("example.com", &gs).await.unwrap_err();
    assert!(matches!(err, ProviderError::RecordExists { .. }));

    // the reconciler treats a duplicate create as converged
    provider::ignore_already_exists(api.set_game_server_external_dns("example.com", &gs).await).unwrap();
}

#[tokio::test]
async fn not_found_on_delete_classifies_as_records_non_existent() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHANGES_PATH))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let api = client(&server);
    let gs = allocated_game_server();

    let err = api.remove_game_server_external_dns("example.com", &gs).await.unwrap_err();
    assert!(matches!(err, ProviderError::RecordsNonExistent { .. }));

    provider::ignore_client_error(api.remove_game_server_external_dns("example.com", &gs).await).unwrap();
}

#[tokio::test]
async fn deletions_submit_both_records() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHANGES_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "pending"})))
        .mount(&server)
        .await;

    client(&server)
        .remove_game_server_external_dns("example.com", &allocated_game_server())
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let change: Change = serde_json::from_slice(&requests[0].body).unwrap();

    assert!(change.additions.is_empty());
    assert_eq!(change.deletions.len(), 2);
}

#[tokio::test]
async fn server_errors_propagate_for_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHANGES_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("quota exceeded"))
        .mount(&server)
        .await;

    let err = client(&server)
        .set_game_server_external_dns("example.com", &allocated_game_server())
        .await
        .unwrap_err();

    match err {
        ProviderError::Api { status, message } => {
            assert_eq!(status, 500);
            assert_eq!(message, "quota exceeded");
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // transient failures are not swallowed by either classifier
    let api = client(&server);
    assert!(provider::ignore_already_exists(api.set_game_server_external_dns("example.com", &allocated_game_server()).await).is_err());
}
