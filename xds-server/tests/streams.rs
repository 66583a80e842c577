use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use tokio::time::timeout;
use xds_server::resource::CLUSTER;
use xds_server::transport::channel::{self, ChannelClient};
use xds_server::{
    ConfigKey, Connection, ConnectionObserver, DeltaDiscoveryRequest, DeltaDiscoveryResponse,
    DiscoveryRequest, DiscoveryResponse, DiscoveryServer, Error, ErrorDetail, Generator, Kind,
    MemoryStore, Node, Proxy, PushContext, PushRequest, Resource, Resources, ServerConfig,
    SnapshotGenerator, TriggerReason, WatchedResource,
};

const NODE_ID: &str = "sidecar~10.0.0.1~reviews-v1.default~default.svc.cluster.local";
const SVC_CLUSTER: &str = "outbound|80||svc.default.svc.cluster.local";

type SotwClient = ChannelClient<DiscoveryRequest, DiscoveryResponse>;
type DeltaClient = ChannelClient<DeltaDiscoveryRequest, DeltaDiscoveryResponse>;

fn cluster(name: &str) -> Resource {
    Resource::new(
        name,
        CLUSTER,
        &Cluster {
            name: name.to_string(),
            ..Default::default()
        },
    )
}

fn clusters(names: &[&str]) -> Vec<Resource> {
    names.iter().map(|name| cluster(name)).collect()
}

fn server(config: ServerConfig) -> DiscoveryServer {
    DiscoveryServer::builder(config, Arc::new(MemoryStore::new()))
        .with_generator(CLUSTER, Arc::new(SnapshotGenerator::new(CLUSTER)))
        .build()
        .unwrap()
}

fn server_with_observer(observer: Arc<Recorder>) -> DiscoveryServer {
    DiscoveryServer::builder(ServerConfig::default(), Arc::new(MemoryStore::new()))
        .with_generator(CLUSTER, Arc::new(SnapshotGenerator::new(CLUSTER)))
        .with_observer(observer)
        .build()
        .unwrap()
}

/// Let the debouncer flush whatever is pending.
async fn settle() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}

fn connect_sotw(server: &DiscoveryServer) -> SotwClient {
    let (requests, sink, client) = channel::pair(8);
    let server = server.clone();
    tokio::spawn(async move {
        let _ = server
            .serve_sotw(requests, sink, "10.0.0.1:41000".to_string(), Vec::new())
            .await;
    });
    client
}

fn connect_delta(server: &DiscoveryServer) -> DeltaClient {
    let (requests, sink, client) = channel::pair(8);
    let server = server.clone();
    tokio::spawn(async move {
        let _ = server
            .serve_delta(requests, sink, "10.0.0.1:41001".to_string(), Vec::new())
            .await;
    });
    client
}

async fn recv<Req, Resp>(client: &mut ChannelClient<Req, Resp>) -> Resp {
    timeout(Duration::from_secs(5), client.recv())
        .await
        .expect("timed out waiting for a response")
        .expect("stream closed")
}

async fn assert_quiet<Req, Resp: std::fmt::Debug>(client: &mut ChannelClient<Req, Resp>) {
    if let Ok(response) = timeout(Duration::from_secs(2), client.recv()).await {
        panic!("unexpected response: {response:?}");
    }
}

fn sotw_request(nonce: &str, version: &str) -> DiscoveryRequest {
    DiscoveryRequest {
        node: nonce.is_empty().then(|| Node::new(NODE_ID)),
        type_url: CLUSTER.to_string(),
        response_nonce: nonce.to_string(),
        version_info: version.to_string(),
        ..Default::default()
    }
}

fn delta_request(subscribe: &[&str], unsubscribe: &[&str], nonce: &str) -> DeltaDiscoveryRequest {
    DeltaDiscoveryRequest {
        node: nonce.is_empty().then(|| Node::new(NODE_ID)),
        type_url: CLUSTER.to_string(),
        resource_names_subscribe: subscribe.iter().map(|s| s.to_string()).collect(),
        resource_names_unsubscribe: unsubscribe.iter().map(|s| s.to_string()).collect(),
        response_nonce: nonce.to_string(),
        ..Default::default()
    }
}

fn resource_names(response: &DeltaDiscoveryResponse) -> Vec<&str> {
    response.resources.iter().map(|r| r.name.as_str()).collect()
}

#[derive(Debug, Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl ConnectionObserver for Recorder {
    fn on_connect(&self, con: &Connection) {
        self.events.lock().unwrap().push(format!("connect {}", con.proxy().id));
    }

    fn on_disconnect(&self, con: &Connection) {
        self.events.lock().unwrap().push(format!("disconnect {}", con.proxy().id));
    }

    fn on_nack(&self, _con: &Connection, _type_url: &str, error: &ErrorDetail) {
        self.events.lock().unwrap().push(format!("nack {}", error.message));
    }
}

#[tokio::test(start_paused = true)]
async fn sotw_ack_then_push_on_change() {
    let server = server(ServerConfig::default());
    server.set_resources(CLUSTER, clusters(&["a", "b"]));
    settle().await;

    let mut client = connect_sotw(&server);
    client.send(sotw_request("", "")).await.unwrap();
    let first = recv(&mut client).await;
    assert_eq!(first.type_url, CLUSTER);
    assert_eq!(first.resources.len(), 2);
    assert!(!first.nonce.is_empty());
    assert_eq!(server.connections().len(), 1);

    client
        .send(sotw_request(&first.nonce, &first.version_info))
        .await
        .unwrap();
    assert_quiet(&mut client).await;

    server.set_resources(CLUSTER, clusters(&["a"]));
    let second = recv(&mut client).await;
    assert_eq!(second.resources.len(), 1);
    assert!(second.nonce > first.nonce);
    assert_ne!(second.version_info, first.version_info);
}

/// Sends every cluster on full pushes and only the first on incremental ones.
#[derive(Debug)]
struct ChangedOnly;

impl Generator for ChangedOnly {
    fn generate(
        &self,
        _proxy: &Proxy,
        _push: &PushContext,
        _watched: &WatchedResource,
        request: &PushRequest,
    ) -> xds_server::Result<Option<Resources>> {
        let names: &[&str] = if request.full { &["a", "b"] } else { &["a"] };
        Ok(Some(clusters(names)))
    }

    fn handles_incremental(&self) -> bool {
        true
    }
}

#[tokio::test(start_paused = true)]
async fn sotw_incremental_push_keeps_wildcard_names() {
    let server = DiscoveryServer::builder(ServerConfig::default(), Arc::new(MemoryStore::new()))
        .with_generator(CLUSTER, Arc::new(ChangedOnly))
        .build()
        .unwrap();

    let mut client = connect_sotw(&server);
    client.send(sotw_request("", "")).await.unwrap();
    let first = recv(&mut client).await;
    assert_eq!(first.resources.len(), 2);
    client
        .send(sotw_request(&first.nonce, &first.version_info))
        .await
        .unwrap();

    server.config_update(PushRequest::incremental(
        TriggerReason::EndpointUpdate,
        [ConfigKey::new(Kind::Service, "a.default.svc.cluster.local", "default")],
    ));
    let second = recv(&mut client).await;
    assert_eq!(second.resources.len(), 1);
    settle().await;

    let con = server.connections().snapshot().pop().unwrap();
    let watched = con.watched(CLUSTER).unwrap();
    assert!(watched.wildcard);
    assert_eq!(
        watched.resource_names,
        BTreeSet::from(["a".to_string(), "b".to_string()])
    );
}

#[tokio::test(start_paused = true)]
async fn delta_responds_with_subscribed_resource_only() {
    let server = server(ServerConfig::default());
    server.set_resources(CLUSTER, clusters(&[SVC_CLUSTER, "outbound|80||other.default.svc.cluster.local"]));
    settle().await;

    let mut client = connect_delta(&server);
    client.send(delta_request(&[SVC_CLUSTER], &[], "")).await.unwrap();
    let response = recv(&mut client).await;
    assert_eq!(resource_names(&response), vec![SVC_CLUSTER]);
    assert!(!response.nonce.is_empty());
    assert!(response.removed_resources.is_empty());

    client
        .send(delta_request(&[], &[], &response.nonce))
        .await
        .unwrap();
    assert_quiet(&mut client).await;
}

#[tokio::test(start_paused = true)]
async fn delta_resubscribe_removes_old_name() {
    let server = server(ServerConfig::default());
    server.set_resources(CLUSTER, clusters(&["X", "Y"]));
    settle().await;

    let mut client = connect_delta(&server);
    client.send(delta_request(&["X"], &[], "")).await.unwrap();
    let first = recv(&mut client).await;
    assert_eq!(resource_names(&first), vec!["X"]);

    client
        .send(delta_request(&["Y"], &["X"], &first.nonce))
        .await
        .unwrap();
    let second = recv(&mut client).await;
    assert_eq!(resource_names(&second), vec!["Y"]);
    assert_eq!(second.removed_resources, vec!["X".to_string()]);

    let con = server.connections().snapshot().pop().unwrap();
    let watched = con.watched(CLUSTER).unwrap();
    assert_eq!(watched.resource_names, BTreeSet::from(["Y".to_string()]));
}

#[tokio::test(start_paused = true)]
async fn delta_subscription_change_pushes_union() {
    let server = server(ServerConfig::default());
    server.set_resources(CLUSTER, clusters(&["A", "B", "C"]));
    settle().await;

    let mut client = connect_delta(&server);
    client.send(delta_request(&["A", "B"], &[], "")).await.unwrap();
    let first = recv(&mut client).await;
    assert_eq!(resource_names(&first), vec!["A", "B"]);

    client
        .send(delta_request(&["C"], &["A"], &first.nonce))
        .await
        .unwrap();
    let second = recv(&mut client).await;
    assert_eq!(resource_names(&second), vec!["C"]);
    assert_eq!(second.removed_resources, vec!["A".to_string()]);

    let con = server.connections().snapshot().pop().unwrap();
    assert_eq!(
        con.watched(CLUSTER).unwrap().resource_names,
        BTreeSet::from(["B".to_string(), "C".to_string()])
    );
}

#[tokio::test(start_paused = true)]
async fn flow_control_holds_push_until_ack() {
    let config = ServerConfig::default().with_flow_control(true, Duration::from_secs(60));
    let server = server(config);
    server.set_resources(CLUSTER, clusters(&["a"]));
    settle().await;

    let mut client = connect_sotw(&server);
    client.send(sotw_request("", "")).await.unwrap();
    let first = recv(&mut client).await;

    server.set_resources(CLUSTER, clusters(&["a", "b"]));
    assert_quiet(&mut client).await;

    client
        .send(sotw_request(&first.nonce, &first.version_info))
        .await
        .unwrap();
    let released = recv(&mut client).await;
    assert_eq!(released.resources.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn flow_control_timeout_releases_push() {
    let config = ServerConfig::default().with_flow_control(true, Duration::from_secs(5));
    let server = server(config);
    server.set_resources(CLUSTER, clusters(&["a"]));
    settle().await;

    let mut client = connect_sotw(&server);
    client.send(sotw_request("", "")).await.unwrap();
    recv(&mut client).await;

    server.set_resources(CLUSTER, clusters(&["a", "b"]));
    let released = timeout(Duration::from_secs(30), client.recv())
        .await
        .expect("blocked push was never released")
        .unwrap();
    assert_eq!(released.resources.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn burst_of_changes_is_one_push() {
    let server = server(ServerConfig::default());
    server.set_resources(CLUSTER, clusters(&["a"]));
    settle().await;

    let mut client = connect_sotw(&server);
    client.send(sotw_request("", "")).await.unwrap();
    let first = recv(&mut client).await;
    client
        .send(sotw_request(&first.nonce, &first.version_info))
        .await
        .unwrap();
    assert_quiet(&mut client).await;

    server.set_resources(CLUSTER, clusters(&["a", "b"]));
    server.set_resources(CLUSTER, clusters(&["a", "b", "c"]));
    server.set_resources(CLUSTER, clusters(&["a", "b", "c", "d"]));

    let pushed = recv(&mut client).await;
    assert_eq!(pushed.resources.len(), 4);
    assert_quiet(&mut client).await;
}

#[tokio::test(start_paused = true)]
async fn nack_is_reported_and_not_answered() {
    let recorder = Arc::new(Recorder::default());
    let server = server_with_observer(Arc::clone(&recorder));
    server.set_resources(CLUSTER, clusters(&["a"]));
    settle().await;

    let mut client = connect_sotw(&server);
    client.send(sotw_request("", "")).await.unwrap();
    let first = recv(&mut client).await;

    let mut nack = sotw_request(&first.nonce, "");
    nack.error_detail = Some(ErrorDetail {
        code: 3,
        message: "unknown cluster field".to_string(),
    });
    client.send(nack).await.unwrap();
    assert_quiet(&mut client).await;

    let con = server.connections().snapshot().pop().unwrap();
    assert_eq!(con.watched(CLUSTER).unwrap().nonce_nacked, first.nonce);

    client.close_send();
    settle().await;
    assert!(server.connections().is_empty());
    assert_eq!(
        recorder.events(),
        vec![
            "connect reviews-v1.default".to_string(),
            "nack unknown cluster field".to_string(),
            "disconnect reviews-v1.default".to_string(),
        ]
    );
}

#[tokio::test]
async fn first_request_without_node_fails() {
    let server = server(ServerConfig::default());
    let (requests, sink, client) = channel::pair(1);
    client
        .send(DiscoveryRequest {
            type_url: CLUSTER.to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let result = server
        .serve_sotw(requests, sink, String::new(), Vec::new())
        .await;
    assert!(matches!(result, Err(Error::MissingNode)), "{result:?}");
    assert!(server.connections().is_empty());
}

#[tokio::test]
async fn shutdown_rejects_new_streams() {
    let server = server(ServerConfig::default());
    server.shutdown();
    let (requests, sink, _client) = channel::pair::<DiscoveryRequest, DiscoveryResponse>(1);
    let result = server
        .serve_sotw(requests, sink, String::new(), Vec::new())
        .await;
    assert!(matches!(result, Err(Error::Shutdown)));
}
