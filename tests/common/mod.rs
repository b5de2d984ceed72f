//! Shared utilities for integration testing.

use std::net::SocketAddr;
use std::time::Duration;

use session_gateway::config::{GatewayConfig, UserSeed};
use session_gateway::http::HttpServer;
use session_gateway::lifecycle::Shutdown;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// A gateway running on an ephemeral port.
pub struct TestGateway {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub config_tx: mpsc::UnboundedSender<GatewayConfig>,
    pub handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Users every test gateway knows.
pub fn seed_users() -> Vec<UserSeed> {
    vec![
        UserSeed {
            id: 1,
            username: "ada".into(),
            active: true,
            role: Some("admin".into()),
            regions: vec!["eu".into(), "us".into()],
            groups: vec!["ops".into()],
        },
        UserSeed {
            id: 2,
            username: "grace".into(),
            active: true,
            role: None,
            regions: vec![],
            groups: vec![],
        },
        UserSeed {
            id: 3,
            username: "mallory".into(),
            active: false,
            role: None,
            regions: vec![],
            groups: vec![],
        },
    ]
}

pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.users = seed_users();
    config
}

/// Start a gateway with `config` on 127.0.0.1:0.
pub async fn start_gateway(config: GatewayConfig) -> TestGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let (config_tx, config_updates) = mpsc::unbounded_channel();
    let server = HttpServer::new(config);
    let server_shutdown = shutdown.subscribe();

    let handle = tokio::spawn(async move { server.run(listener, config_updates, server_shutdown).await });

    // The listener is already bound; give the accept loop a moment.
    tokio::time::sleep(Duration::from_millis(50)).await;

    TestGateway {
        addr,
        shutdown,
        config_tx,
        handle,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
