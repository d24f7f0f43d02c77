use std::time::Duration;

use tonic::transport::Channel;
use tonic_health::pb::health_check_response::ServingStatus as Status;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

use super::*;

async fn health_client(addr: SocketAddr) -> HealthClient<Channel> {
    let channel = Channel::from_shared(format!("http://{}", addr))
        .expect("valid endpoint")
        .connect()
        .await
        .expect("connect to health service");
    HealthClient::new(channel)
}

async fn health_status(addr: SocketAddr, service: &str) -> i32 {
    health_client(addr)
        .await
        .check(HealthCheckRequest {
            service: service.to_string(),
        })
        .await
        .expect("health check")
        .into_inner()
        .status
}

#[tokio::test]
async fn test_bind_and_serve_health() {
    let mut host = ServiceHost::new("rpc");
    let addr = host.bind("127.0.0.1:0").await.unwrap();
    assert_eq!(host.state(), HostState::Listening);
    assert_ne!(addr.port(), 0);

    host.serve(Server::builder(), FatalSignal::new()).await.unwrap();
    assert_eq!(host.state(), HostState::Serving);

    assert_eq!(health_status(addr, "").await, Status::Serving as i32);

    host.stop(Some(Duration::from_secs(5))).await.unwrap();
    assert_eq!(host.state(), HostState::Stopped);
}

#[tokio::test]
async fn test_bind_conflict_fails() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = taken.local_addr().unwrap().to_string();

    let mut host = ServiceHost::new("rpc");
    let result = host.bind(&address).await;

    assert!(matches!(result, Err(HostError::Bind { .. })));
    assert_eq!(host.state(), HostState::Unbound);
}

#[tokio::test]
async fn test_register_rejects_duplicates() {
    let mut host = ServiceHost::new("rpc");
    host.register("handlerd.Handler", |_| {}).unwrap();

    let result = host.register("handlerd.Handler", |_| {});

    assert!(matches!(
        result,
        Err(HostError::AlreadyRegistered("handlerd.Handler"))
    ));
    assert_eq!(host.groups(), &["handlerd.Handler"]);
}

#[tokio::test]
async fn test_register_after_serve_is_rejected() {
    let mut host = ServiceHost::new("rpc");
    host.bind("127.0.0.1:0").await.unwrap();
    host.serve(Server::builder(), FatalSignal::new()).await.unwrap();

    let result = host.register("handlerd.ApplicationManager", |_| {});

    assert!(matches!(
        result,
        Err(HostError::InvalidState(HostState::Serving))
    ));
    host.stop(None).await.unwrap();
}

#[tokio::test]
async fn test_serve_requires_listener() {
    let mut host = ServiceHost::new("rpc");
    let result = host.serve(Server::builder(), FatalSignal::new()).await;
    assert!(matches!(
        result,
        Err(HostError::InvalidState(HostState::Unbound))
    ));
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let mut host = ServiceHost::new("rpc");
    host.bind("127.0.0.1:0").await.unwrap();
    host.serve(Server::builder(), FatalSignal::new()).await.unwrap();

    host.stop(None).await.unwrap();
    host.stop(None).await.unwrap();

    assert_eq!(host.state(), HostState::Stopped);
}

#[tokio::test]
async fn test_stop_before_serve_releases_listener() {
    let mut host = ServiceHost::new("rpc");
    let addr = host.bind("127.0.0.1:0").await.unwrap();

    host.stop(None).await.unwrap();

    assert_eq!(host.state(), HostState::Stopped);
    assert!(std::net::TcpListener::bind(addr).is_ok());
}

async fn serving_with_watcher() -> (ServiceHost, tonic::Streaming<tonic_health::pb::HealthCheckResponse>) {
    let mut host = ServiceHost::new("rpc");
    host.register("handlerd.Handler", |_| {}).unwrap();
    let addr = host.bind("127.0.0.1:0").await.unwrap();
    host.serve(Server::builder(), FatalSignal::new()).await.unwrap();

    let mut stream = health_client(addr)
        .await
        .watch(HealthCheckRequest {
            service: "handlerd.Handler".to_string(),
        })
        .await
        .unwrap()
        .into_inner();
    let first = stream.message().await.unwrap().unwrap();
    assert_eq!(first.status, Status::Serving as i32);
    (host, stream)
}

#[tokio::test]
async fn test_stop_terminates_open_watch_stream() {
    let (mut host, _stream) = serving_with_watcher().await;
    let addr = host.local_addr().unwrap();

    tokio::time::timeout(Duration::from_secs(5), host.stop(None))
        .await
        .expect("stop does not wait for open streams")
        .unwrap();

    assert_eq!(host.state(), HostState::Stopped);
    assert!(std::net::TcpListener::bind(addr).is_ok());
}

#[tokio::test]
async fn test_stop_with_grace_cuts_off_open_watch_stream() {
    let (mut host, _stream) = serving_with_watcher().await;
    let grace = Duration::from_millis(200);

    let result = tokio::time::timeout(Duration::from_secs(5), host.stop(Some(grace)))
        .await
        .expect("stop returns once the grace period elapses");

    assert!(matches!(result, Err(HostError::DrainTimeout(limit)) if limit == grace));
    assert_eq!(host.state(), HostState::Stopped);
}
