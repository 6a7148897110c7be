//! Admin HTTP surface over the fleet service
//!
//! JSON capability routes keyed by server id, a Server-Sent Events log tail
//! and a WebSocket endpoint that attaches observers to the event hub.

use crate::error::{adapter_error_response, json_error_response, ErrorCode};
use crate::hub::WireMessage;
use crate::model::{Alert, LogLine, ServerDescriptor, ServerStatus};
use crate::service::FleetService;
use futures::{future, SinkExt, StreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full, Limited, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{
    HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_TYPE, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, UPGRADE,
};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest request body accepted (config uploads included)
const MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

const SERVERS_PREFIX: &str = "/api/v1/servers";

pub type Body = BoxBody<Bytes, Infallible>;

fn full(body: impl Into<Bytes>) -> Body {
    Full::new(body.into()).boxed()
}

fn empty() -> Body {
    Empty::new().boxed()
}

fn response(status: StatusCode, body: Body) -> Response<Body> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    resp
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Body> {
    match serde_json::to_vec(value) {
        Ok(bytes) => {
            let mut resp = response(status, full(bytes));
            resp.headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            resp
        }
        Err(e) => {
            error!(error = %e, "Failed to encode response body");
            error_response(ErrorCode::BadRequest, "response could not be encoded")
        }
    }
}

fn error_response(code: ErrorCode, message: impl Into<String>) -> Response<Body> {
    json_error_response(code, message).map(|b| b.boxed())
}

/// Admin API server
pub struct AdminServer {
    bind_addr: SocketAddr,
    service: Arc<FleetService>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    pub fn new(bind_addr: SocketAddr, service: Arc<FleetService>, shutdown_rx: watch::Receiver<bool>) -> Self {
        Self {
            bind_addr,
            service,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let service = Arc::clone(&self.service);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, service).await {
                                    debug!(addr = %peer, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, service: Arc<FleetService>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let svc = service_fn(move |req| {
        let service = Arc::clone(&service);
        async move { Ok::<_, Infallible>(handle_request(req, service).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, svc)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

/// Route a request to the matching capability
pub async fn handle_request(req: Request<Incoming>, service: Arc<FleetService>) -> Response<Body> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Admin API request");

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, full("ok")),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            &serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            }),
        ),

        (&Method::GET, "/ws") => upgrade_observer(req, &service),

        (&Method::GET, SERVERS_PREFIX) => list_servers(&service),

        (&Method::POST, "/api/v1/alerts") => match read_json::<Alert>(req).await {
            Ok(alert) => {
                service.on_alert_created(alert);
                response(StatusCode::ACCEPTED, empty())
            }
            Err(resp) => resp,
        },

        (_, p) if p.starts_with(SERVERS_PREFIX) => match parse_server_route(p) {
            Some((server_id, action)) => server_action(req, &service, &server_id, &action).await,
            None => error_response(ErrorCode::NotFound, format!("no route for {}", p)),
        },

        _ => error_response(ErrorCode::NotFound, format!("no route for {} {}", method, path)),
    }
}

/// Split `/api/v1/servers/{id}/{action}` into its decoded parts
fn parse_server_route(path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix(SERVERS_PREFIX)?.strip_prefix('/')?;
    let (raw_id, action) = rest.split_once('/')?;
    if raw_id.is_empty() || action.is_empty() || action.contains('/') {
        return None;
    }
    let server_id = urlencoding::decode(raw_id).ok()?.into_owned();
    Some((server_id, action.to_string()))
}

async fn server_action(
    req: Request<Incoming>,
    service: &Arc<FleetService>,
    server_id: &str,
    action: &str,
) -> Response<Body> {
    let method = req.method().clone();
    match (&method, action) {
        (&Method::GET, "health") => match service.check_health(server_id).await {
            Ok(report) => json_response(StatusCode::OK, &report),
            Err(e) => adapter_error_response(&e).map(|b| b.boxed()),
        },
        (&Method::GET, "metrics") => match service.metrics(server_id).await {
            Ok(metrics) => json_response(StatusCode::OK, &metrics),
            Err(e) => adapter_error_response(&e).map(|b| b.boxed()),
        },
        (&Method::GET, "config") => match service.config(server_id).await {
            Ok(config) => json_response(StatusCode::OK, &config),
            Err(e) => adapter_error_response(&e).map(|b| b.boxed()),
        },
        (&Method::PUT, "config") => {
            let body = match read_json::<ConfigUpload>(req).await {
                Ok(body) => body,
                Err(resp) => return resp,
            };
            match service.put_config(server_id, &body.content).await {
                Ok(validation) => json_response(StatusCode::OK, &validation),
                Err(e) => adapter_error_response(&e).map(|b| b.boxed()),
            }
        }
        (&Method::POST, "reload") => match service.reload(server_id).await {
            Ok(()) => json_response(StatusCode::OK, &serde_json::json!({ "reloaded": true })),
            Err(e) => adapter_error_response(&e).map(|b| b.boxed()),
        },
        (&Method::POST, "invalidate") => {
            service.invalidate(server_id).await;
            response(StatusCode::NO_CONTENT, empty())
        }
        (&Method::GET, "logs") => tail_logs(service, server_id).await,
        (method, action) => error_response(
            ErrorCode::NotFound,
            format!("no route for {} {}/{}/{}", method, SERVERS_PREFIX, server_id, action),
        ),
    }
}

#[derive(Debug, Deserialize)]
struct ConfigUpload {
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServerSummary {
    #[serde(flatten)]
    server: ServerDescriptor,
    status: ServerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_token_mask: Option<String>,
}

fn list_servers(service: &FleetService) -> Response<Body> {
    let servers: Vec<ServerSummary> = service
        .directory()
        .list()
        .into_iter()
        .map(|server| ServerSummary {
            status: service.status_of(&server.id),
            api_token_mask: service.api_token_mask(&server),
            server,
        })
        .collect();
    json_response(StatusCode::OK, &servers)
}

async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<T, Response<Body>> {
    let bytes = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Err(error_response(
                ErrorCode::BadRequest,
                format!("failed to read request body: {}", e),
            ))
        }
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| error_response(ErrorCode::BadRequest, format!("invalid JSON body: {}", e)))
}

fn sse_frame(line: &LogLine) -> Option<Bytes> {
    let data = serde_json::to_string(line).ok()?;
    Some(Bytes::from(format!("event: log\ndata: {}\n\n", data)))
}

async fn tail_logs(service: &FleetService, server_id: &str) -> Response<Body> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let lines = match service.tail_logs(server_id, cancel_rx).await {
        Ok(lines) => lines,
        Err(e) => return adapter_error_response(&e).map(|b| b.boxed()),
    };
    info!(server_id, "Log tail opened");

    // The body owns the cancel sender; a client disconnect drops both and
    // stops the remote tail
    let frames = lines.filter_map(move |line| {
        let _ = &cancel_tx;
        future::ready(sse_frame(&line).map(|bytes| Ok::<_, Infallible>(Frame::data(bytes))))
    });

    let mut resp = response(StatusCode::OK, BodyExt::boxed(StreamBody::new(frames)));
    let headers = resp.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    resp
}

fn to_ws_message(msg: WireMessage) -> Message {
    match msg {
        WireMessage::Text(text) => Message::Text(text),
        WireMessage::Ping => Message::Ping(Vec::new()),
        WireMessage::Pong => Message::Pong(Vec::new()),
        WireMessage::Close => Message::Close(None),
    }
}

fn from_ws_message(frame: Result<Message, WsError>) -> Option<Result<WireMessage, WsError>> {
    match frame {
        Ok(Message::Text(text)) => Some(Ok(WireMessage::Text(text))),
        Ok(Message::Ping(_)) => Some(Ok(WireMessage::Ping)),
        Ok(Message::Pong(_)) => Some(Ok(WireMessage::Pong)),
        Ok(Message::Close(_)) => Some(Ok(WireMessage::Close)),
        Ok(Message::Binary(_)) | Ok(Message::Frame(_)) => None,
        Err(e) => Some(Err(e)),
    }
}

fn upgrade_observer(mut req: Request<Incoming>, service: &Arc<FleetService>) -> Response<Body> {
    let wants_websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let key = match req.headers().get(SEC_WEBSOCKET_KEY) {
        Some(key) if wants_websocket => derive_accept_key(key.as_bytes()),
        _ => return error_response(ErrorCode::BadRequest, "expected a WebSocket upgrade request"),
    };
    let accept = match HeaderValue::from_str(&key) {
        Ok(value) => value,
        Err(_) => return error_response(ErrorCode::BadRequest, "invalid Sec-WebSocket-Key"),
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    let hub = Arc::clone(service.hub());
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                let (sink, stream) = ws.split();
                let sink = sink.with(|msg: WireMessage| future::ready(Ok::<_, WsError>(to_ws_message(msg))));
                let stream = stream.filter_map(|frame| future::ready(from_ws_message(frame)));
                hub.attach(sink, stream).await;
            }
            Err(e) => warn!(error = %e, "WebSocket upgrade failed"),
        }
    });

    let mut resp = response(StatusCode::SWITCHING_PROTOCOLS, empty());
    let headers = resp.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::AdapterFactory;
    use crate::hub::{EventHub, HubConfig};
    use crate::model::{AlertSeverity, ConnectionKind, ProxyFamily};
    use crate::pool::{PoolConfig, TransportPool};
    use crate::service::{InMemoryDirectory, OperationTimeouts, StatusPolicy};
    use crate::transport::{Connector, ShellParams, ShellTransport, TransportError};
    use crate::vault::CredentialVault;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::time::Duration;

    struct NoShell;

    #[async_trait]
    impl Connector for NoShell {
        async fn connect(&self, _params: &ShellParams) -> Result<Arc<dyn ShellTransport>, TransportError> {
            Err(TransportError::Connect("no shell in tests".into()))
        }
    }

    fn stub(id: &str, port: u16) -> ServerDescriptor {
        ServerDescriptor {
            id: id.into(),
            name: String::new(),
            host: "127.0.0.1".into(),
            port,
            proxy_type: ProxyFamily::Other,
            connection_type: ConnectionKind::Api,
            ssh_user: None,
            ssh_key_enc: None,
            api_url: None,
            api_token_enc: None,
        }
    }

    fn test_vault() -> Arc<CredentialVault> {
        Arc::new(CredentialVault::from_hex(&CredentialVault::generate_key_hex()).unwrap())
    }

    async fn start(servers: Vec<ServerDescriptor>) -> (String, Arc<FleetService>, watch::Sender<bool>) {
        start_with_vault(servers, test_vault()).await
    }

    async fn start_with_vault(
        servers: Vec<ServerDescriptor>,
        vault: Arc<CredentialVault>,
    ) -> (String, Arc<FleetService>, watch::Sender<bool>) {
        let pool = TransportPool::new(Arc::new(NoShell), PoolConfig::default());
        let service = FleetService::new(
            Arc::new(InMemoryDirectory::new(servers)),
            AdapterFactory::new(vault, pool, reqwest::Client::new(), Duration::from_secs(1)),
            EventHub::new(HubConfig::default()),
            OperationTimeouts::default(),
            StatusPolicy::default(),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = AdminServer::new(addr, Arc::clone(&service), shutdown_rx);
        tokio::spawn(server.serve(listener));
        (format!("127.0.0.1:{}", addr.port()), service, shutdown_tx)
    }

    #[test]
    fn test_parse_server_route() {
        assert_eq!(
            parse_server_route("/api/v1/servers/edge-1/metrics"),
            Some(("edge-1".to_string(), "metrics".to_string()))
        );
        assert_eq!(
            parse_server_route("/api/v1/servers/edge%201/config"),
            Some(("edge 1".to_string(), "config".to_string()))
        );
        assert_eq!(parse_server_route("/api/v1/servers/edge-1"), None);
        assert_eq!(parse_server_route("/api/v1/servers//health"), None);
        assert_eq!(parse_server_route("/api/v1/servers/a/b/c"), None);
    }

    #[test]
    fn test_ws_message_mapping() {
        assert_eq!(to_ws_message(WireMessage::Text("x".into())), Message::Text("x".into()));
        assert!(matches!(
            from_ws_message(Ok(Message::Close(None))),
            Some(Ok(WireMessage::Close))
        ));
        assert!(from_ws_message(Ok(Message::Binary(vec![1, 2]))).is_none());
    }

    #[tokio::test]
    async fn test_health_and_version() {
        let (addr, _service, _shutdown) = start(vec![]).await;
        let client = reqwest::Client::new();

        let resp = client.get(format!("http://{}/health", addr)).send().await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "ok");

        let resp = client.get(format!("http://{}/version", addr)).send().await.unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["name"], PKG_NAME);
    }

    #[tokio::test]
    async fn test_errors_carry_code_header() {
        let (addr, _service, _shutdown) = start(vec![stub("x1", 1)]).await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("http://{}/api/v1/servers/ghost/metrics", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.headers()["x-fleet-error"], "SERVER_NOT_FOUND");

        let resp = client
            .post(format!("http://{}/api/v1/servers/x1/reload", addr))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 501);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "NOT_SUPPORTED");

        let resp = client
            .put(format!("http://{}/api/v1/servers/x1/config", addr))
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn test_server_listing_and_metrics() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (addr, _service, _shutdown) = start(vec![stub("x1", port)]).await;
        let client = reqwest::Client::new();

        let resp = client
            .get(format!("http://{}/api/v1/servers/x1/health", addr))
            .send()
            .await
            .unwrap();
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "online");

        let body: serde_json::Value = client
            .get(format!("http://{}/api/v1/servers", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body[0]["id"], "x1");
        assert_eq!(body[0]["status"], "online");

        let body: serde_json::Value = client
            .get(format!("http://{}/api/v1/servers/x1/metrics", addr))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["serverId"], "x1");
        assert_eq!(body["activeConnections"], 0);
    }

    #[tokio::test]
    async fn test_listing_shows_masked_api_token() {
        let vault = test_vault();
        let mut sealed = stub("x1", 1);
        sealed.api_token_enc = Some(vault.encrypt("token-abcd1234").unwrap());
        let mut foreign = stub("x2", 1);
        foreign.api_token_enc = Some(test_vault().encrypt("token-wxyz9876").unwrap());
        let (addr, _service, _shutdown) = start_with_vault(vec![sealed, foreign, stub("x3", 1)], vault).await;

        let text = reqwest::get(format!("http://{}/api/v1/servers", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(!text.contains("token-abcd1234"));
        assert!(!text.contains("token-wxyz9876"));
        assert!(!text.contains("apiTokenEnc"));

        let body: serde_json::Value = serde_json::from_str(&text).unwrap();
        let by_id = |id: &str| {
            body.as_array()
                .unwrap()
                .iter()
                .find(|s| s["id"] == id)
                .cloned()
                .unwrap()
        };
        assert_eq!(by_id("x1")["apiTokenMask"], "***1234");
        assert!(by_id("x2").get("apiTokenMask").is_none());
        assert!(by_id("x3").get("apiTokenMask").is_none());
    }

    #[tokio::test]
    async fn test_websocket_observer_receives_alerts() {
        let (addr, service, _shutdown) = start(vec![]).await;

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();

        // Wait for the hub to register the observer
        for _ in 0..50 {
            if service.hub().observer_count().await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(service.hub().observer_count().await, 1);

        let alert = Alert {
            id: "a1".into(),
            server_id: Some("x1".into()),
            server_name: None,
            severity: AlertSeverity::Critical,
            status: "active".into(),
            title: "Upstream down".into(),
            message: String::new(),
            category: "health".into(),
            timestamp: Utc::now(),
        };
        let resp = reqwest::Client::new()
            .post(format!("http://{}/api/v1/alerts", addr))
            .json(&alert)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);

        let frame = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break text,
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected frame: {:?}", other),
                }
            }
        })
        .await
        .unwrap();
        let frame: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(frame["type"], "alert");
        assert_eq!(frame["payload"]["title"], "Upstream down");

        ws.send(Message::Text(r#"{"type":"ping"}"#.into())).await.unwrap();
        let pong = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(pong, Message::Text(r#"{"type":"pong","payload":{}}"#.into()));
    }

    #[tokio::test]
    async fn test_plain_get_on_ws_is_rejected() {
        let (addr, _service, _shutdown) = start(vec![]).await;
        let resp = reqwest::get(format!("http://{}/ws", addr)).await.unwrap();
        assert_eq!(resp.status(), 400);
    }
}
