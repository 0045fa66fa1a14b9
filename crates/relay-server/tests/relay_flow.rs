//! End-to-end scenarios driven over real sockets: a background task
//! plays the desktop app, `reqwest` plays a browser hitting the
//! session's public subdomain, and `tokio-tungstenite` plays a client
//! attaching to the bridge. Mirrors how this corpus tests socket-level
//! protocols against a live, locally-bound instance rather than calling
//! handlers directly.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relay_protocol::{BridgeRequestEnvelope, BridgeResponseEnvelope, ControlMessage, HttpResponseEnvelope};
use relay_server::config::Config;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const BASE_DOMAIN: &str = "relay.test";
const JWT_SECRET: &str = "integration-test-secret";

struct TestServer {
    addr: SocketAddr,
}

impl TestServer {
    fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/ws?{}", self.addr, query)
    }

    fn http_client(&self) -> (reqwest::Client, String) {
        let client = reqwest::Client::builder().build().unwrap();
        let url = format!("http://{}", self.addr);
        (client, url)
    }
}

async fn spawn_server() -> TestServer {
    let (server, _state) = spawn_server_with_state().await;
    server
}

async fn spawn_server_with_state() -> (TestServer, relay_server::state::AppState) {
    let config = Config {
        listen_port: 0,
        base_domain: BASE_DOMAIN.to_string(),
        jwt_secret: JWT_SECRET.to_string(),
        store_backend: relay_server::config::StoreBackend::InProcess,
        store_connection: None,
        session_ttl: Duration::from_secs(60),
        http_timeout_page: Duration::from_secs(2),
        http_timeout_asset: Duration::from_secs(2),
        bridge_timeout: Duration::from_secs(2),
        pending_per_desktop_max: 100,
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let state = relay_server::build_state(config).await;
    let state_for_test = state.clone();
    let app = relay_server::build_router(state);

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (TestServer { addr }, state_for_test)
}

async fn connect_desktop(
    server: &TestServer,
    device_id: &str,
) -> (
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    relay_protocol::RegisteredReply,
) {
    let url = server.ws_url(&format!("role=desktop&deviceId={device_id}"));
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let reply = loop {
        let Some(Ok(WsMessage::Text(text))) = socket.next().await else {
            panic!("desktop socket closed before registration");
        };
        match serde_json::from_str::<ControlMessage>(&text).unwrap() {
            ControlMessage::Registered(reply) => break reply,
            _ => continue,
        }
    };

    (socket, reply)
}

#[tokio::test]
async fn health_endpoint_reports_zero_desktops_initially() {
    let server = spawn_server().await;
    let (client, base_url) = server.http_client();
    let body: serde_json::Value = client
        .get(format!("{base_url}/health"))
        .header(reqwest::header::HOST, BASE_DOMAIN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["desktops"], 0);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn desktop_registration_and_http_round_trip() {
    let server = spawn_server().await;
    let (mut desktop, reply) = connect_desktop(&server, "dev-1").await;

    let (client, base_url) = server.http_client();
    let subdomain = relay_protocol::session_id::to_subdomain(&reply.session_id);
    let host_header = format!("{subdomain}.{BASE_DOMAIN}");

    let request = tokio::spawn({
        let client = client.clone();
        let base_url = base_url.clone();
        let host_header = host_header.clone();
        async move {
            client
                .get(format!("{base_url}/greet"))
                .header(reqwest::header::HOST, host_header)
                .send()
                .await
                .unwrap()
        }
    });

    let Some(Ok(WsMessage::Text(text))) = desktop.next().await else {
        panic!("expected http:request on desktop socket");
    };
    let forwarded = match serde_json::from_str::<ControlMessage>(&text).unwrap() {
        ControlMessage::HttpRequest(envelope) => envelope,
        other => panic!("unexpected message: {other:?}"),
    };
    assert_eq!(forwarded.url, "/greet");
    assert_eq!(forwarded.method, "GET");

    let response = ControlMessage::HttpResponse(HttpResponseEnvelope {
        id: forwarded.id,
        status: 200,
        headers: std::collections::HashMap::from([(
            "content-type".to_string(),
            "text/plain".to_string(),
        )]),
        body: Some(b"hello from the desktop".to_vec()),
    });
    desktop
        .send(WsMessage::Text(serde_json::to_string(&response).unwrap().into()))
        .await
        .unwrap();

    let response = request.await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "hello from the desktop");
}

#[tokio::test]
async fn request_times_out_when_desktop_never_responds() {
    let server = spawn_server().await;
    let (mut desktop, reply) = connect_desktop(&server, "dev-2").await;

    let (client, base_url) = server.http_client();
    let subdomain = relay_protocol::session_id::to_subdomain(&reply.session_id);
    let host_header = format!("{subdomain}.{BASE_DOMAIN}");

    let response = client
        .get(format!("{base_url}/slow"))
        .header(reqwest::header::HOST, host_header)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 504);

    // Drain so the desktop socket doesn't look disconnected mid-test.
    let _ = desktop.next().await;
}

#[tokio::test]
async fn request_to_unregistered_session_returns_404() {
    let server = spawn_server().await;
    let (client, base_url) = server.http_client();
    let response = client
        .get(format!("{base_url}/anything"))
        .header(reqwest::header::HOST, format!("abc234.{BASE_DOMAIN}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn request_to_registered_but_offline_session_returns_503() {
    let (server, state) = spawn_server_with_state().await;

    let registration = relay_server::session::DesktopRegistration {
        session_id: "ABC234".to_string(),
        device_id: "dev-offline".to_string(),
        url: "https://abc234.relay.test".to_string(),
        created_at_epoch_ms: relay_server::session::now_epoch_ms(),
    };
    state
        .session_store
        .put("ABC234", registration, Duration::from_secs(60))
        .await
        .unwrap();

    let (client, base_url) = server.http_client();
    let response = client
        .get(format!("{base_url}/anything"))
        .header(reqwest::header::HOST, format!("abc234.{BASE_DOMAIN}"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
}

#[tokio::test]
async fn request_with_no_session_subdomain_returns_404() {
    let server = spawn_server().await;
    let (client, base_url) = server.http_client();
    let response = client
        .get(format!("{base_url}/anything"))
        .header(reqwest::header::HOST, BASE_DOMAIN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn client_attach_rejects_invalid_token() {
    let server = spawn_server().await;
    let (_desktop, reply) = connect_desktop(&server, "dev-3").await;

    let url = server.ws_url(&format!(
        "role=client&sessionId={}&token=not-a-real-token",
        reply.session_id
    ));
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let Some(Ok(WsMessage::Text(text))) = socket.next().await else {
        panic!("expected an error message");
    };
    match serde_json::from_str::<ControlMessage>(&text).unwrap() {
        ControlMessage::Error { .. } => {}
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn bridge_request_round_trips_with_the_clients_own_request_id() {
    let server = spawn_server().await;
    let (mut desktop, reply) = connect_desktop(&server, "dev-4").await;

    let url = server.ws_url(&format!(
        "role=client&sessionId={}&token={}",
        reply.session_id, reply.token
    ));
    let (mut client, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    let call = ControlMessage::BridgeRequest(BridgeRequestEnvelope {
        request_id: "client-call-1".to_string(),
        event: "terminal:create".to_string(),
        args: vec![serde_json::json!({"cols": 80})],
    });
    client
        .send(WsMessage::Text(serde_json::to_string(&call).unwrap().into()))
        .await
        .unwrap();

    let Some(Ok(WsMessage::Text(text))) = desktop.next().await else {
        panic!("expected bridge:request on desktop socket");
    };
    let forwarded = match serde_json::from_str::<ControlMessage>(&text).unwrap() {
        ControlMessage::BridgeRequest(envelope) => envelope,
        other => panic!("unexpected message: {other:?}"),
    };
    assert_eq!(forwarded.event, "terminal:create");
    assert_ne!(forwarded.request_id, "client-call-1");

    let ack = ControlMessage::BridgeResponse(BridgeResponseEnvelope {
        request_id: forwarded.request_id,
        response: serde_json::json!({"terminalId": "t-1"}),
    });
    desktop
        .send(WsMessage::Text(serde_json::to_string(&ack).unwrap().into()))
        .await
        .unwrap();

    let Some(Ok(WsMessage::Text(text))) = client.next().await else {
        panic!("expected bridge:response on client socket");
    };
    match serde_json::from_str::<ControlMessage>(&text).unwrap() {
        ControlMessage::BridgeResponse(envelope) => {
            assert_eq!(envelope.request_id, "client-call-1");
            assert_eq!(envelope.response["terminalId"], "t-1");
        }
        other => panic!("unexpected message: {other:?}"),
    }
}
