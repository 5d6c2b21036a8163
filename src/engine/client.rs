//! Typed client for the engine's control API

use crate::error::{ForgeError, Result};
use futures::stream::{self, StreamExt};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout of the liveness probe
const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Slack added on top of the engine-side delay timeout
const DELAY_REQUEST_SLACK: Duration = Duration::from_secs(5);

/// Body of a delay probe.
///
/// The engine answers with either `{"delay", "meanDelay"}` or `{"message"}`;
/// a missing `delay` means the proxy is unreachable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
    #[serde(default, rename = "meanDelay", skip_serializing_if = "Option::is_none")]
    pub mean_delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl DelayResponse {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.delay.is_some()
    }
}

/// Delay probe parameters forwarded to the engine
#[derive(Debug, Clone)]
pub struct DelayProbe {
    pub timeout_ms: u64,
    pub test_url: String,
}

/// Control-API client bound to one engine instance
#[derive(Debug, Clone)]
pub struct EngineClient {
    http: Client,
    base: Url,
}

impl EngineClient {
    /// `controller` is the `host:port` the engine's external controller listens on
    pub fn new(controller: &str) -> Result<Self> {
        let base = Url::parse(&format!("http://{}/", controller)).map_err(|e| {
            ForgeError::InvalidConfig(format!("controller address {}: {}", controller, e))
        })?;
        let http = Client::builder().no_proxy().build()?;
        Ok(Self { http, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.clear().extend(segments);
        }
        url
    }

    /// Liveness probe against the controller root
    pub async fn is_ready(&self) -> bool {
        match self
            .http
            .get(self.base.clone())
            .timeout(READY_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Ask the engine to measure the delay of one named proxy
    pub async fn ping(&self, name: &str, probe: &DelayProbe) -> DelayResponse {
        let url = self.endpoint(&["proxies", name, "delay"]);
        let response = self
            .http
            .get(url)
            .query(&[
                ("timeout", probe.timeout_ms.to_string()),
                ("url", probe.test_url.clone()),
            ])
            .timeout(Duration::from_millis(probe.timeout_ms) + DELAY_REQUEST_SLACK)
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return DelayResponse::failed(e.to_string()),
        };
        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return DelayResponse::failed(e.to_string()),
        };
        debug!("{} {}", name, body.trim());

        match serde_json::from_str::<DelayResponse>(&body) {
            Ok(parsed) if status == StatusCode::OK => parsed,
            Ok(parsed) => DelayResponse::failed(
                parsed.message.unwrap_or_else(|| format!("status {}", status)),
            ),
            Err(e) => DelayResponse::failed(format!("status {}: {}", status, e)),
        }
    }

    /// Ping every name with at most `concurrency` probes in flight
    pub async fn ping_all(
        &self,
        names: &[String],
        probe: &DelayProbe,
        concurrency: usize,
    ) -> HashMap<String, DelayResponse> {
        stream::iter(names)
            .map(|name| async move { (name.clone(), self.ping(name, probe).await) })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await
    }

    /// Make `proxy` the active route of `group`.
    ///
    /// Anything but `204 No Content` is a failure, reported with its status.
    pub async fn try_select(&self, group: &str, proxy: &str) -> Result<()> {
        let url = self.endpoint(&["proxies", group]);
        let status = match self
            .http
            .put(url)
            .json(&json!({ "name": proxy }))
            .send()
            .await
        {
            Ok(response) if response.status() == StatusCode::NO_CONTENT => return Ok(()),
            Ok(response) => response.status().to_string(),
            Err(e) => e.to_string(),
        };
        Err(ForgeError::SelectFailed {
            group: group.to_string(),
            proxy: proxy.to_string(),
            status,
        })
    }

    pub async fn select(&self, group: &str, proxy: &str) -> bool {
        match self.try_select(group, proxy).await {
            Ok(()) => true,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::{
        extract::{Path, Query, State},
        http::StatusCode as AxumStatus,
        routing::{get, put},
        Json, Router,
    };
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    /// In-process stand-in for the engine's control API
    #[derive(Clone, Default)]
    pub(crate) struct FakeEngine {
        pub reachable: Arc<HashSet<String>>,
        pub rejected: Arc<HashSet<String>>,
        pub selected: Arc<Mutex<Vec<String>>>,
        pub egress: Arc<HashMap<String, String>>,
    }

    impl FakeEngine {
        pub(crate) fn new(reachable: &[&str], rejected: &[&str]) -> Self {
            Self {
                reachable: Arc::new(reachable.iter().map(|s| s.to_string()).collect()),
                rejected: Arc::new(rejected.iter().map(|s| s.to_string()).collect()),
                selected: Arc::default(),
                egress: Arc::default(),
            }
        }

        /// Echo body served on connections opened while `name` is selected
        pub(crate) fn with_egress(mut self, pairs: &[(&str, &str)]) -> Self {
            self.egress = Arc::new(
                pairs
                    .iter()
                    .map(|(name, ip)| (name.to_string(), ip.to_string()))
                    .collect(),
            );
            self
        }

        pub(crate) fn router(&self) -> Router {
            Router::new()
                .route("/", get(|| async { Json(json!({ "hello": "clash" })) }))
                .route("/proxies/:name/delay", get(delay))
                .route("/proxies/:group", put(select))
                .with_state(self.clone())
        }

        /// Serve on a random local port; returns `host:port`
        pub(crate) async fn spawn(&self) -> String {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let app = self.router();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            addr.to_string()
        }

        /// Serve the outbound listener on a random local port.
        ///
        /// Like the real engine, a connection stays bound to the route that
        /// was selected when it was accepted, and it is kept alive across
        /// requests.
        pub(crate) async fn spawn_mixed(&self) -> u16 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let engine = self.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let route = engine.selected.lock().unwrap().last().cloned();
                    let body = route.and_then(|name| engine.egress.get(&name).cloned());
                    tokio::spawn(serve_route(stream, body));
                }
            });
            port
        }
    }

    async fn serve_route(stream: TcpStream, body: Option<String>) {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);
        let mut line = String::new();
        loop {
            // skip the request head up to its blank line
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) if line == "\r\n" => break,
                    Ok(_) => {}
                }
            }
            let response = match &body {
                Some(body) => format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}\n",
                    body.len() + 1,
                    body
                ),
                None => "HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\n\r\n".to_string(),
            };
            if write.write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
    }

    async fn delay(
        State(engine): State<FakeEngine>,
        Path(name): Path<String>,
        Query(params): Query<HashMap<String, String>>,
    ) -> (AxumStatus, Json<serde_json::Value>) {
        assert!(params.contains_key("timeout"));
        assert!(params.contains_key("url"));
        if engine.reachable.contains(&name) {
            (AxumStatus::OK, Json(json!({ "delay": 120, "meanDelay": 130 })))
        } else {
            (AxumStatus::OK, Json(json!({ "message": "Timeout" })))
        }
    }

    async fn select(
        State(engine): State<FakeEngine>,
        Path(group): Path<String>,
        Json(body): Json<serde_json::Value>,
    ) -> AxumStatus {
        let name = body["name"].as_str().unwrap_or_default().to_string();
        if group != "GLOBAL" || engine.rejected.contains(&name) {
            return AxumStatus::BAD_REQUEST;
        }
        engine.selected.lock().unwrap().push(name);
        AxumStatus::NO_CONTENT
    }

    fn probe() -> DelayProbe {
        DelayProbe {
            timeout_ms: 2000,
            test_url: "http://www.gstatic.com/generate_204".to_string(),
        }
    }

    #[test]
    fn test_delay_response_parsing() {
        let ok: DelayResponse = serde_json::from_str(r#"{"delay": 88, "meanDelay": 90}"#).unwrap();
        assert!(ok.is_reachable());
        assert_eq!(ok.mean_delay, Some(90));

        let timeout: DelayResponse = serde_json::from_str(r#"{"message": "Timeout"}"#).unwrap();
        assert!(!timeout.is_reachable());
        assert_eq!(timeout.message.as_deref(), Some("Timeout"));
    }

    #[test]
    fn test_endpoint_escapes_names() {
        let client = EngineClient::new("127.0.0.1:9090").unwrap();
        let url = client.endpoint(&["proxies", "HK 01/边缘", "delay"]);
        assert_eq!(url.path_segments().unwrap().count(), 3);
        assert!(url.as_str().starts_with("http://127.0.0.1:9090/proxies/HK%2001%2F"));
    }

    #[tokio::test]
    async fn test_is_ready() {
        let addr = FakeEngine::default().spawn().await;
        assert!(EngineClient::new(&addr).unwrap().is_ready().await);

        let unused = crate::proxy::ports::next_free_port(45000).unwrap();
        let client = EngineClient::new(&format!("127.0.0.1:{}", unused)).unwrap();
        assert!(!client.is_ready().await);
    }

    #[tokio::test]
    async fn test_ping_reports_reachability_by_key() {
        let addr = FakeEngine::new(&["up"], &[]).spawn().await;
        let client = EngineClient::new(&addr).unwrap();

        let up = client.ping("up", &probe()).await;
        assert_eq!(up.delay, Some(120));

        let down = client.ping("down", &probe()).await;
        assert!(!down.is_reachable());
        assert_eq!(down.message.as_deref(), Some("Timeout"));
    }

    #[tokio::test]
    async fn test_ping_all_is_keyed_by_name() {
        let addr = FakeEngine::new(&["a", "c"], &[]).spawn().await;
        let client = EngineClient::new(&addr).unwrap();
        let names: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();

        let results = client.ping_all(&names, &probe(), 2).await;
        assert_eq!(results.len(), 3);
        assert!(results["a"].is_reachable());
        assert!(!results["b"].is_reachable());
        assert!(results["c"].is_reachable());
    }

    #[tokio::test]
    async fn test_select_success_and_failure() {
        let engine = FakeEngine::new(&[], &["bad"]);
        let addr = engine.spawn().await;
        let client = EngineClient::new(&addr).unwrap();

        assert!(client.select("GLOBAL", "good").await);
        assert!(!client.select("GLOBAL", "bad").await);
        assert!(!client.select("OTHER", "good").await);
        match client.try_select("GLOBAL", "bad").await {
            Err(ForgeError::SelectFailed {
                group,
                proxy,
                status,
            }) => {
                assert_eq!(group, "GLOBAL");
                assert_eq!(proxy, "bad");
                assert_eq!(status, "400 Bad Request");
            }
            other => panic!("expected a select failure, got {:?}", other),
        }
        assert_eq!(*engine.selected.lock().unwrap(), vec!["good".to_string()]);
    }
}
