use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use anyhow::{Context, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{body, Body, Method, Request, Response, Server, StatusCode};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const LOGIN: &str = "operator";
pub const PASSWORD: &str = "hunter2";
const TOKEN: &str = "mock-access-token";

/// Resources served by the mock management API.
#[derive(Clone)]
pub struct MockFleet {
    inner: Arc<RwLock<MockFleetInner>>,
    token_revoked: Arc<AtomicBool>,
    window_unavailable: Arc<AtomicBool>,
    nodelist_unavailable: Arc<AtomicBool>,
}

struct MockFleetInner {
    window: Value,
    measurement_types: Value,
    targets: Value,
    nodelists: Value,
    pushed_nodelists: Vec<Vec<String>>,
    hits: HashMap<String, usize>,
}

impl MockFleet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MockFleetInner {
                window: json!({"id": 1, "activated": 0, "start": 0, "end": 0, "updated_at": 0}),
                measurement_types: json!([]),
                targets: json!([]),
                nodelists: json!([]),
                pushed_nodelists: Vec::new(),
                hits: HashMap::new(),
            })),
            token_revoked: Arc::new(AtomicBool::new(false)),
            window_unavailable: Arc::new(AtomicBool::new(false)),
            nodelist_unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_window(&self, activated: bool, start: i64, end: i64, updated_at: i64) {
        self.inner.write().expect("mock fleet poisoned").window = json!({
            "id": 1,
            "activated": if activated { 1 } else { 0 },
            "start": start,
            "end": end,
            "updated_at": updated_at,
        });
    }

    pub fn set_resources(&self, measurement_types: Value, targets: Value, nodelists: Value) {
        let mut inner = self.inner.write().expect("mock fleet poisoned");
        inner.measurement_types = measurement_types;
        inner.targets = targets;
        inner.nodelists = nodelists;
    }

    pub fn revoke_token(&self) {
        self.token_revoked.store(true, Ordering::SeqCst);
    }

    pub fn set_window_unavailable(&self, unavailable: bool) {
        self.window_unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_nodelist_unavailable(&self, unavailable: bool) {
        self.nodelist_unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn pushed_nodelists(&self) -> Vec<Vec<String>> {
        self.inner
            .read()
            .expect("mock fleet poisoned")
            .pushed_nodelists
            .clone()
    }

    /// Requests seen for `"<METHOD> <path>"`.
    pub fn hits(&self, route: &str) -> usize {
        self.inner
            .read()
            .expect("mock fleet poisoned")
            .hits
            .get(route)
            .copied()
            .unwrap_or(0)
    }
}

pub struct MockApiServer {
    url: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockApiServer {
    pub async fn start(fleet: MockFleet) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to bind mock API listener")?;
        let addr = listener
            .local_addr()
            .context("failed to read mock listener address")?;
        let std_listener = listener
            .into_std()
            .context("failed to convert mock listener")?;
        std_listener
            .set_nonblocking(true)
            .context("failed to set mock listener non-blocking")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let make_service = make_service_fn(move |_| {
            let fleet = fleet.clone();
            async move { Ok::<_, Infallible>(service_fn(move |req| serve_request(fleet.clone(), req))) }
        });

        let server = Server::from_tcp(std_listener)
            .context("failed to build mock HTTP server")?
            .serve(make_service);
        let graceful = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        let handle = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                eprintln!("mock API server stopped: {err}");
            }
        });

        Ok(Self {
            url: format!("http://{}", addr),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn serve_request(fleet: MockFleet, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let authorized = req
        .headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {TOKEN}"))
        && !fleet.token_revoked.load(Ordering::SeqCst);

    {
        let mut inner = fleet.inner.write().expect("mock fleet poisoned");
        *inner.hits.entry(format!("{method} {path}")).or_default() += 1;
    }

    let bytes = match body::to_bytes(req.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => return Ok(reply(StatusCode::BAD_REQUEST, format!("failed to read body: {err}"))),
    };

    if method == Method::POST && path == "/authentication" {
        let form: HashMap<String, String> = url::form_urlencoded::parse(&bytes)
            .into_owned()
            .collect();
        let accepted = form.get("login").map(String::as_str) == Some(LOGIN)
            && form.get("password").map(String::as_str) == Some(PASSWORD);
        return Ok(if accepted {
            json_reply(json!({"access_token": TOKEN, "token_type": "bearer"}))
        } else {
            reply(StatusCode::UNAUTHORIZED, "invalid credentials")
        });
    }

    if !authorized {
        return Ok(reply(StatusCode::UNAUTHORIZED, "missing or invalid token"));
    }

    let inner_value = |select: fn(&MockFleetInner) -> Value| {
        select(&fleet.inner.read().expect("mock fleet poisoned"))
    };

    let response = match (method, path.as_str()) {
        (Method::PUT, "/v1/nodelists") if fleet.nodelist_unavailable.load(Ordering::SeqCst) => {
            reply(StatusCode::SERVICE_UNAVAILABLE, "node list store temporarily unavailable")
        }
        (Method::PUT, "/v1/nodelists") => match serde_json::from_slice::<Vec<String>>(&bytes) {
            Ok(nodes) => {
                fleet
                    .inner
                    .write()
                    .expect("mock fleet poisoned")
                    .pushed_nodelists
                    .push(nodes);
                json_reply(json!({"status": "ok"}))
            }
            Err(err) => reply(StatusCode::BAD_REQUEST, format!("invalid node list: {err}")),
        },
        (Method::GET, "/v1/ddostests/1") => {
            if fleet.window_unavailable.load(Ordering::SeqCst) {
                reply(StatusCode::SERVICE_UNAVAILABLE, "window temporarily unavailable")
            } else {
                json_reply(inner_value(|inner| inner.window.clone()))
            }
        }
        (Method::GET, "/v1/measurementtypes") => {
            json_reply(inner_value(|inner| inner.measurement_types.clone()))
        }
        (Method::GET, "/v1/targets") => json_reply(inner_value(|inner| inner.targets.clone())),
        (Method::GET, "/v1/nodelists") => json_reply(inner_value(|inner| inner.nodelists.clone())),
        (method, path) => reply(StatusCode::NOT_FOUND, format!("no route for {method} {path}")),
    };

    Ok(response)
}

fn reply(status: StatusCode, message: impl Into<String>) -> Response<Body> {
    let mut response = Response::new(Body::from(message.into()));
    *response.status_mut() = status;
    response
}

fn json_reply(value: Value) -> Response<Body> {
    let mut response = Response::new(Body::from(value.to_string()));
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}
