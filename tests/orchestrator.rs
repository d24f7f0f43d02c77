//! Process orchestration integration tests.
//!
//! Starts the full process against the in-memory store and mock brokers and
//! checks startup gating, listener wiring and shutdown ordering.

mod common;

use std::time::Duration;

use reqwest::StatusCode;
use tonic::Code;
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;

use handlerd::bus::{BrokerAttachment, BrokerKind};
use handlerd::handler::HandlerState;
use handlerd::process::{steps, Orchestrator};
use handlerd::proxy::{ApplicationBody, ErrorBody};
use handlerd::storage::KvStore;
use handlerd::{Error, ReleaseError};

use common::*;

// ============================================================================
// Scenario A: RPC listener only
// ============================================================================

mod rpc_only {
    use super::*;

    #[tokio::test]
    async fn test_starts_rpc_listener_with_two_groups() {
        let deps = TestDependencies::new();
        let config = test_config();
        let port = config.server.port;

        let running = Orchestrator::new(config, deps.clone()).start().await.unwrap();

        assert_eq!(running.rpc_addr().port(), port);
        assert!(running.http_addr().is_none());
        assert_eq!(running.handler().state(), HandlerState::Serving);
        assert_eq!(
            running.pending_steps(),
            vec![steps::STORE, steps::HANDLER, steps::RPC_SERVER]
        );

        let mut health = HealthClient::new(rpc_channel(running.rpc_addr()).await);
        for group in ["handlerd.Handler", "handlerd.ApplicationManager"] {
            let status = health
                .check(HealthCheckRequest {
                    service: group.to_string(),
                })
                .await
                .unwrap()
                .into_inner()
                .status;
            assert_eq!(status, ServingStatus::Serving as i32, "{group}");
        }
        drop(health);

        let report = running.shutdown().await;

        assert!(report.is_clean());
        assert_eq!(
            report.steps,
            vec![steps::RPC_SERVER, steps::HANDLER, steps::STORE]
        );
        assert_eq!(deps.store.release_count(), 1);
        assert!(!is_bound(port));
    }

    #[tokio::test]
    async fn test_shutdown_completes_with_open_health_watch() {
        let deps = TestDependencies::new();
        let config = test_config();
        let port = config.server.port;

        let running = Orchestrator::new(config, deps.clone()).start().await.unwrap();
        let mut health = HealthClient::new(rpc_channel(running.rpc_addr()).await);
        let mut watch = health
            .watch(HealthCheckRequest {
                service: "handlerd.Handler".to_string(),
            })
            .await
            .unwrap()
            .into_inner();
        let first = watch.message().await.unwrap().unwrap();
        assert_eq!(first.status, ServingStatus::Serving as i32);

        let report = tokio::time::timeout(Duration::from_secs(5), running.shutdown())
            .await
            .expect("shutdown is not held by an open stream");

        assert!(report.is_clean());
        assert_eq!(
            report.steps,
            vec![steps::RPC_SERVER, steps::HANDLER, steps::STORE]
        );
        assert_eq!(deps.store.release_count(), 1);
        assert!(!is_bound(port));
    }

    #[tokio::test]
    async fn test_run_returns_after_signal() {
        let deps = TestDependencies::new();
        let config = test_config();
        let port = config.server.port;
        let orchestrator = Orchestrator::new(config, deps.clone());

        let signal = async move {
            while !is_bound(port) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        let report = tokio::time::timeout(Duration::from_secs(10), orchestrator.run(signal))
            .await
            .expect("run finishes")
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(
            deps.journal.entries(),
            vec!["rpc-server.stop", "store.close"]
        );
        assert!(!is_bound(port));
    }

    #[tokio::test]
    async fn test_uplink_reaches_attachments() {
        let deps = TestDependencies::new();
        let mut config = test_config();
        config.pubsub.target = "nats:4222".to_string();

        let running = Orchestrator::new(config, deps.clone()).start().await.unwrap();
        let channel = rpc_channel(running.rpc_addr()).await;

        // Any well-formed token is accepted when no access keys are set.
        let mut manager = ApplicationManagerClient::new(channel.clone());
        manager
            .register_application(with_token(
                Application {
                    app_id: "app-1".to_string(),
                    description: String::new(),
                },
                "any",
            ))
            .await
            .unwrap();

        let mut handler = HandlerClient::new(channel);
        handler
            .handle_uplink(UplinkMessage {
                app_id: "app-1".to_string(),
                dev_id: "dev-1".to_string(),
                port: 1,
                payload: b"hi".to_vec(),
                upstream_id: "dev".to_string(),
            })
            .await
            .unwrap();

        let published = deps.pubsub.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "app-1.devices.dev-1.up");

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_management_rpc_requires_token() {
        let deps = TestDependencies::new();
        let running = Orchestrator::new(test_config(), deps.clone())
            .start()
            .await
            .unwrap();

        let mut manager = ApplicationManagerClient::new(rpc_channel(running.rpc_addr()).await);
        let status = manager
            .get_application(ApplicationIdentifier {
                app_id: "app-1".to_string(),
            })
            .await
            .unwrap_err();

        assert_eq!(status.code(), Code::Unauthenticated);
        running.shutdown().await;
    }
}

// ============================================================================
// Scenario B: RPC and HTTP proxy
// ============================================================================

mod with_proxy {
    use super::*;

    #[tokio::test]
    async fn test_request_without_token_is_rejected_before_rpc() {
        let deps = TestDependencies::new();
        let config = test_config_with_proxy(&["secret"]);

        let running = Orchestrator::new(config, deps.clone()).start().await.unwrap();
        let http_addr = running.http_addr().expect("proxy enabled");

        let client = reqwest::Client::new();
        let response = client
            .post(format!("http://{}/applications", http_addr))
            .json(&ApplicationBody {
                app_id: "app-1".to_string(),
                description: String::new(),
            })
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: ErrorBody = response.json().await.unwrap();
        assert_eq!(body.code, Code::Unauthenticated as i32);
        assert_eq!(deps.store.len().await, 0);

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_rest_routes_translate_to_rpc() {
        let deps = TestDependencies::new();
        let config = test_config_with_proxy(&["secret"]);

        let running = Orchestrator::new(config, deps.clone()).start().await.unwrap();
        let base = format!("http://{}/applications", running.http_addr().unwrap());
        let client = reqwest::Client::new();
        let app = ApplicationBody {
            app_id: "app-1".to_string(),
            description: "first".to_string(),
        };

        let response = client
            .post(&base)
            .bearer_auth("secret")
            .json(&app)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(deps.store.len().await, 1);

        let response = client
            .get(format!("{}/app-1", base))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.json::<ApplicationBody>().await.unwrap(), app);

        let response = client
            .get(format!("{}/app-1", base))
            .bearer_auth("wrong")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = client
            .delete(format!("{}/app-1", base))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = client
            .get(format!("{}/app-1", base))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = client
            .get(format!("{}/Not-Valid", base))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_order() {
        let deps = TestDependencies::new();
        let mut config = test_config_with_proxy(&["secret"]);
        config.queue.target = "rabbit:5672".to_string();

        let running = Orchestrator::new(config, deps.clone()).start().await.unwrap();
        let rpc_port = running.rpc_addr().port();
        let http_port = running.http_addr().unwrap().port();

        let report = running.shutdown().await;

        assert!(report.is_clean());
        assert_eq!(
            report.steps,
            vec![
                steps::EDGE_PROXY,
                steps::RPC_SERVER,
                steps::HANDLER,
                steps::STORE
            ]
        );
        assert_eq!(
            deps.journal.entries(),
            vec![
                "queue.connect",
                "edge-proxy.cancel",
                "rpc-server.stop",
                "queue.disconnect",
                "store.close"
            ]
        );
        assert!(!is_bound(rpc_port));
        assert!(!is_bound(http_port));
    }

    #[tokio::test]
    async fn test_proxy_bind_failure_releases_everything() {
        let deps = TestDependencies::new();
        let config = test_config_with_proxy(&[]);
        let rpc_port = config.server.port;
        let _taken = std::net::TcpListener::bind(("127.0.0.1", config.http.port)).unwrap();

        let result = Orchestrator::new(config, deps.clone()).start().await;

        assert!(matches!(
            result,
            Err(Error::ListenFailed {
                listener: "http",
                ..
            })
        ));
        assert_eq!(deps.store.release_count(), 1);
        assert!(!is_bound(rpc_port));
    }
}

// ============================================================================
// Scenario C and startup failures
// ============================================================================

mod startup_failures {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_store_opens_no_listener() {
        let deps = TestDependencies::new();
        deps.store.set_unreachable(true);
        let config = test_config_with_proxy(&[]);
        let rpc_port = config.server.port;
        let http_port = config.http.port;

        let result = Orchestrator::new(config, deps.clone()).start().await;

        assert!(matches!(result, Err(Error::StoreUnavailable(_))));
        assert!(!is_bound(rpc_port));
        assert!(!is_bound(http_port));
        assert!(deps.journal.entries().is_empty());
        assert_eq!(deps.store.release_count(), 0);
        assert!(deps.specs().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_connects_nothing() {
        let deps = TestDependencies::new();
        let mut config = test_config();
        config.store.address.clear();

        let result = Orchestrator::new(config, deps.clone()).start().await;

        assert!(matches!(result, Err(Error::ConfigInvalid(_))));
        assert_eq!(deps.store_connects(), 0);
    }

    #[tokio::test]
    async fn test_identity_failure_releases_store() {
        let deps = TestDependencies::new();
        let mut config = test_config();
        config.server.address_announce = "bad host".to_string();
        let rpc_port = config.server.port;

        let result = Orchestrator::new(config, deps.clone()).start().await;

        assert!(matches!(result, Err(Error::IdentityInitFailed(_))));
        assert_eq!(deps.journal.entries(), vec!["store.close"]);
        assert!(!is_bound(rpc_port));
    }

    #[tokio::test]
    async fn test_broker_connect_failure_is_handler_init_failure() {
        let deps = TestDependencies::new();
        deps.queue.set_fail_on_connect(true);
        let mut config = test_config();
        config.queue.target = "rabbit:5672".to_string();
        let rpc_port = config.server.port;

        let result = Orchestrator::new(config, deps.clone()).start().await;

        assert!(matches!(result, Err(Error::HandlerInitFailed(_))));
        assert!(!deps.queue.is_connected());
        assert_eq!(deps.store.release_count(), 1);
        assert!(!is_bound(rpc_port));
    }

    #[tokio::test]
    async fn test_rpc_bind_failure_shuts_down_handler() {
        let deps = TestDependencies::new();
        let mut config = test_config();
        config.queue.target = "rabbit:5672".to_string();
        let _taken = std::net::TcpListener::bind(("127.0.0.1", config.server.port)).unwrap();

        let result = Orchestrator::new(config, deps.clone()).start().await;

        assert!(matches!(
            result,
            Err(Error::ListenFailed {
                listener: "rpc",
                ..
            })
        ));
        assert_eq!(
            deps.journal.entries(),
            vec!["queue.connect", "queue.disconnect", "store.close"]
        );
    }
}

// ============================================================================
// Optional composition
// ============================================================================

mod composition {
    use super::*;

    #[tokio::test]
    async fn test_zero_http_port_means_no_proxy() {
        let deps = TestDependencies::new();
        let mut config = test_config();
        config.http.address = "127.0.0.1".to_string();
        config.http.port = 0;

        let running = Orchestrator::new(config, deps).start().await.unwrap();

        assert!(running.http_addr().is_none());
        assert!(!running.pending_steps().contains(&steps::EDGE_PROXY));
        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_http_address_means_no_proxy() {
        let deps = TestDependencies::new();
        let mut config = test_config();
        config.http.address.clear();
        let http_port = free_port();
        config.http.port = http_port;

        let running = Orchestrator::new(config, deps).start().await.unwrap();

        assert!(running.http_addr().is_none());
        assert!(!is_bound(http_port));
        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_secondary_broker_attached_once() {
        let deps = TestDependencies::new();
        let mut config = test_config();
        config.queue.target = "rabbit:5672".to_string();

        let running = Orchestrator::new(config, deps.clone()).start().await.unwrap();

        assert_eq!(running.handler().attachments(), vec![BrokerKind::Queue]);
        assert!(deps.queue.is_connected());
        assert!(!deps.pubsub.is_connected());
        let specs = deps.specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].routing_key.as_deref(), Some("handler"));
        running.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_broker_targets_means_no_attachments() {
        let deps = TestDependencies::new();

        let running = Orchestrator::new(test_config(), deps.clone())
            .start()
            .await
            .unwrap();

        assert!(running.handler().attachments().is_empty());
        assert!(deps.specs().is_empty());
        running.shutdown().await;
    }
}

// ============================================================================
// Shutdown
// ============================================================================

mod shutdown {
    use super::*;

    #[tokio::test]
    async fn test_failed_broker_release_still_releases_store() {
        let deps = TestDependencies::new();
        let mut config = test_config();
        config.pubsub.target = "nats:4222".to_string();
        config.queue.target = "rabbit:5672".to_string();

        let running = Orchestrator::new(config, deps.clone()).start().await.unwrap();
        deps.queue.set_fail_on_disconnect(true);

        let report = running.shutdown().await;

        assert_eq!(report.errors.len(), 1);
        let (step, error) = &report.errors[0];
        assert_eq!(*step, steps::HANDLER);
        assert!(matches!(
            error,
            ReleaseError::Broker {
                kind: BrokerKind::Queue,
                ..
            }
        ));
        assert!(deps.store.is_closed());
        assert_eq!(deps.store.release_count(), 1);
        assert_eq!(deps.pubsub.disconnect_count(), 1);
        assert!(
            deps.journal.position("queue.disconnect").unwrap()
                < deps.journal.position("store.close").unwrap()
        );
    }

    #[tokio::test]
    async fn test_handler_shutdown_twice_is_noop() {
        let deps = TestDependencies::new();
        let mut config = test_config();
        config.queue.target = "rabbit:5672".to_string();

        let running = Orchestrator::new(config, deps.clone()).start().await.unwrap();
        let handler = running.handler().clone();

        assert!(handler.shutdown().await.is_empty());
        let report = running.shutdown().await;

        assert!(report.is_clean());
        assert_eq!(handler.state(), HandlerState::Stopped);
        assert_eq!(deps.store.release_count(), 1);
        assert_eq!(deps.queue.disconnect_count(), 1);
    }
}
