//! Shared integration-test harness: an in-process processor over a stub
//! backend, plus helpers for running the real HTTP server.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tokio_util::sync::CancellationToken;

use tapedeck::bounds::BoundsRegistry;
use tapedeck::error::LiveCallError;
use tapedeck::model::{AttractorBit, Attractors, RequestData, ResponseData};
use tapedeck::processor::CallProcessor;
use tapedeck::replay::{HttpUpstream, Upstream};
use tapedeck::server::{AppState, build_router, serve};
use tapedeck::tape::{Chapter, Tape, TapeCatalog};

/// Backend stand-in answering `200 live <path>` and counting calls.
#[derive(Debug, Default)]
pub struct StubBackend {
    calls: AtomicUsize,
    delay: Option<Duration>,
}

impl StubBackend {
    /// A backend that sleeps before answering.
    pub fn slow(delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay: Some(delay),
        }
    }

    /// Calls received so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for StubBackend {
    async fn call(&self, _base_url: &str, request: &RequestData) -> Result<ResponseData, LiveCallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ResponseData::status(200)
            .with_header("Content-Type", "text/plain")
            .with_body(format!("live {}", request.path())))
    }
}

/// A processor wired to a [`StubBackend`].
pub struct Harness {
    pub processor: Arc<CallProcessor>,
    pub backend: Arc<StubBackend>,
}

impl Harness {
    pub fn new(catalog: TapeCatalog) -> Self {
        Self::with_backend(catalog, StubBackend::default())
    }

    pub fn with_backend(catalog: TapeCatalog, backend: StubBackend) -> Self {
        let backend = Arc::new(backend);
        let processor = Arc::new(CallProcessor::new(
            Arc::new(catalog),
            backend.clone(),
            Arc::new(BoundsRegistry::new()),
        ));
        Self { processor, backend }
    }

    pub fn catalog(&self) -> &TapeCatalog {
        self.processor.catalog()
    }

    pub async fn get(&self, url: &str) -> ResponseData {
        self.processor.handle(&RequestData::new("GET", url)).await
    }
}

/// A tape routing every path under `prefix`.
pub fn routed_tape(name: &str, prefix: &str) -> Tape {
    Tape::new(name).with_attractors(Attractors::routing(AttractorBit::new(format!("^{prefix}"))))
}

/// A stored `GET path` chapter answering `200 body`.
pub fn stored_chapter(path: &str, body: &str) -> Chapter {
    Chapter::record(
        format!("GET {path}"),
        RequestData::new("GET", path),
        Some(ResponseData::status(200).with_body(body)),
    )
}

/// Path of tape `name` in `dir`.
pub fn tape_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

/// A running tapedeck HTTP server.
pub struct TestServer {
    pub addr: SocketAddr,
    pub base_url: String,
    pub client: reqwest::Client,
    pub processor: Arc<CallProcessor>,
    cancel: CancellationToken,
}

impl TestServer {
    /// Serves `catalog` with the real HTTP upstream.
    pub async fn start(catalog: TapeCatalog) -> Self {
        let upstream = HttpUpstream::new(Duration::from_secs(5), Some("tapedeck-tests")).unwrap();
        let processor = Arc::new(CallProcessor::new(
            Arc::new(catalog),
            Arc::new(upstream),
            Arc::new(BoundsRegistry::new()),
        ));
        let cancel = CancellationToken::new();
        let router = build_router(AppState::new(Arc::clone(&processor)));
        let (addr, _task) = serve("127.0.0.1:0", router, cancel.clone()).await.unwrap();
        Self {
            addr,
            base_url: format!("http://{addr}"),
            client: reqwest::Client::new(),
            processor,
            cancel,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs `router` as a throwaway backend; returns its base URL.
pub async fn spawn_backend(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

/// Runs the `tapedeck` binary to completion.
pub fn run_cli(args: &[&str]) -> std::process::Output {
    std::process::Command::new(env!("CARGO_BIN_EXE_tapedeck"))
        .args(args)
        .arg("--quiet")
        .output()
        .expect("failed to run tapedeck")
}
