//! End-to-end session tests with a scripted stand-in for ssh
#![cfg(unix)]

use axum::routing::get;
use axum::Router;
use pgrok_client::{
    derive_remote_port, CertStatus, ProxyConfig, RelayConfig, Session, SessionEvent,
    SessionOptions, Subdomain, TunnelStatus,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;

const ONLINE_SCRIPT: &str = "\
echo 'Provisioning TLS certificate for demo.example.com'
echo 'TLS certificate ready.'
echo 'pgrok tunnel active: https://demo.example.com'
exec sleep 30";

async fn start_target() -> SocketAddr {
    let app = Router::new().route("/", get(|| async { "Hello from local service!" }));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn relay() -> RelayConfig {
    RelayConfig::parse("PGROK_HOST=relay.test\nPGROK_DOMAIN=example.com\n", None).unwrap()
}

fn options(target_port: u16, script: &str) -> SessionOptions {
    let mut options = SessionOptions::new(Subdomain::parse("demo").unwrap(), target_port)
        .with_transport("sh", ["-c", script]);
    options.proxy = ProxyConfig {
        target_host: "127.0.0.1".to_string(),
        target_port,
        bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        preferred_port: 0,
    };
    options
}

async fn next_matching<F>(
    events: &mut broadcast::Receiver<SessionEvent>,
    mut matches: F,
) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if matches(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not published in time")
}

#[tokio::test]
async fn test_session_goes_online_and_records_requests() {
    let target = start_target().await;
    let mut session = Session::start(options(target.port(), ONLINE_SCRIPT), &relay())
        .await
        .unwrap();

    assert_eq!(session.expected_url(), "https://demo.example.com");
    assert_eq!(session.remote_port(), derive_remote_port("demo"));
    assert_eq!(session.remote_port(), 22_566);

    let mut state = session.watch_state();
    tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.is_online()))
        .await
        .expect("tunnel never came online")
        .unwrap();

    let current = session.state();
    assert_eq!(current.status, TunnelStatus::Online);
    assert_eq!(current.cert_status, CertStatus::Ready);
    assert_eq!(current.url.as_deref(), Some("https://demo.example.com"));

    let mut events = session.subscribe();
    let body = reqwest::get(format!("http://{}/", session.proxy_addr()))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "Hello from local service!");

    match next_matching(&mut events, |e| matches!(e, SessionEvent::Request(_))).await {
        SessionEvent::Request(entry) => {
            assert_eq!(entry.request.path, "/");
            assert_eq!(entry.request.status_code, 200);
        }
        other => panic!("unexpected event {:?}", other),
    }

    assert_eq!(session.recent_requests(10).len(), 1);
    assert_eq!(session.stats().total_requests, 1);

    let proxy_addr = session.proxy_addr();
    session.shutdown();
    session.shutdown();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(proxy_addr).await.is_err());
    println!("✅ Session lifecycle test passed");
}

#[tokio::test]
async fn test_process_exit_is_terminal_error() {
    let target = start_target().await;
    let script = "echo 'Error: subdomain demo is already in use' >&2; exit 2";
    let session = Session::start(options(target.port(), script), &relay())
        .await
        .unwrap();

    let mut state = session.watch_state();
    let last = tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| s.error.as_deref() == Some("Tunnel process exited with code 2")),
    )
    .await
    .expect("exit was not reported")
    .unwrap()
    .clone();

    assert_eq!(last.status, TunnelStatus::Error);

    tokio::time::timeout(Duration::from_secs(5), session.tunnel_exited())
        .await
        .expect("exit flag not set");
    assert!(session.has_exited());
}

#[tokio::test]
async fn test_stats_are_republished_without_traffic() {
    let target = start_target().await;
    let session = Session::start(options(target.port(), ONLINE_SCRIPT), &relay())
        .await
        .unwrap();
    let mut events = session.subscribe();

    match next_matching(&mut events, |e| matches!(e, SessionEvent::Stats(_))).await {
        SessionEvent::Stats(stats) => {
            assert_eq!(stats.total_requests, 0);
            assert_eq!(stats.rate_1m, 0.0);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_transport_fails_startup() {
    let target = start_target().await;
    let options = options(target.port(), "exit 0")
        .with_transport("/nonexistent/pgrok-ssh", Vec::<String>::new());

    let err = Session::start(options, &relay()).await.err().unwrap();
    assert!(err.to_string().contains("/nonexistent/pgrok-ssh"));
}
