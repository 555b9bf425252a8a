//! Shared fixtures for pipeline integration tests.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use agrivision_core::layout::orthophoto_in;
use agrivision_core::{RunConfig, SkipFlags};
use agrivision_pipeline::{
    Architecture, CancellationFlag, EngineError, EngineRequest, PhotogrammetryEngine, Pipeline, ServiceLauncher,
    StartupRecipe,
};
use async_trait::async_trait;
use image::{Rgba, RgbaImage};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Engine that writes a synthetic 4-band orthophoto.
#[derive(Default)]
pub struct FakeEngine {
    pub calls: AtomicUsize,
}

impl FakeEngine {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// 16x16 field: healthy left half, bare right half, transparent bottom rows.
pub fn orthophoto_image() -> RgbaImage {
    RgbaImage::from_fn(16, 16, |x, y| match (x < 8, y >= 14) {
        (_, true) => Rgba([0, 0, 0, 0]),
        (true, false) => Rgba([30, 200, 10, 255]),
        (false, false) => Rgba([120, 130, 10, 255]),
    })
}

#[async_trait]
impl PhotogrammetryEngine for FakeEngine {
    async fn build(&self, request: &EngineRequest) -> Result<(), EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let images = request.datasets_root.join(&request.project).join("images");
        assert!(fs::read_dir(&images).map(|d| d.count() > 0).unwrap_or(false));

        let ortho = orthophoto_in(&request.datasets_root.join(&request.project));
        fs::create_dir_all(ortho.parent().unwrap()).map_err(EngineError::Spawn)?;
        orthophoto_image()
            .save(&ortho)
            .map_err(|e| EngineError::Spawn(std::io::Error::other(e.to_string())))?;
        Ok(())
    }
}

/// Engine that builds like [`FakeEngine`] and then raises the interrupt flag,
/// as if ctrl-c arrived while the engine was running.
pub struct InterruptingEngine {
    pub inner: FakeEngine,
    pub flag: CancellationFlag,
}

#[async_trait]
impl PhotogrammetryEngine for InterruptingEngine {
    async fn build(&self, request: &EngineRequest) -> Result<(), EngineError> {
        self.inner.build(request).await?;
        self.flag.cancel();
        Ok(())
    }
}

/// Engine that always fails like a crashed container.
pub struct FailingEngine;

#[async_trait]
impl PhotogrammetryEngine for FailingEngine {
    async fn build(&self, _request: &EngineRequest) -> Result<(), EngineError> {
        Err(EngineError::Failed {
            exit_code: Some(1),
            stderr_tail: "[ERROR] Not enough images to reconstruct".to_string(),
        })
    }
}

/// Launcher that records launches and optionally starts a stub service.
#[derive(Default)]
pub struct RecordingLauncher {
    pub launches: Mutex<Vec<StartupRecipe>>,
    pub start_stub_on: Option<u16>,
}

impl RecordingLauncher {
    pub fn launch_count(&self) -> usize {
        self.launches.lock().unwrap().len()
    }
}

#[async_trait]
impl ServiceLauncher for RecordingLauncher {
    async fn launch(&self, recipe: &StartupRecipe) -> Result<(), String> {
        self.launches.lock().unwrap().push(recipe.clone());
        if let Some(port) = self.start_stub_on {
            let listener = TcpListener::bind(("127.0.0.1", port))
                .await
                .map_err(|e| e.to_string())?;
            tokio::spawn(serve(listener, Arc::new(Mutex::new(Vec::new()))));
        }
        Ok(())
    }
}

/// A loopback port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Launcher whose start command never finishes.
#[derive(Default)]
pub struct HangingLauncher {
    pub launches: AtomicUsize,
}

#[async_trait]
impl ServiceLauncher for HangingLauncher {
    async fn launch(&self, _recipe: &StartupRecipe) -> Result<(), String> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        Ok(())
    }
}

/// Minimal weather service: `/`, `/api/v1/auth/token`, `/api/data/weather`
/// and `/api/data/forecast5`.
pub struct StubWeather {
    pub base_url: String,
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl StubWeather {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        tokio::spawn(serve(listener, requests.clone()));
        Self { base_url, requests }
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn serve(listener: TcpListener, requests: Arc<Mutex<Vec<String>>>) {
    while let Ok((mut socket, _)) = listener.accept().await {
        let requests = requests.clone();
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);
                if let Some(end) = find_header_end(&buf) {
                    let head = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                    let body_len = head
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + body_len {
                        break;
                    }
                }
            }
            let request = String::from_utf8_lossy(&buf).to_string();
            let path = request
                .split_whitespace()
                .nth(1)
                .unwrap_or("/")
                .split('?')
                .next()
                .unwrap_or("/")
                .to_string();
            requests.lock().unwrap().push(request);

            let (status, body) = match path.as_str() {
                "/" => ("200 OK", r#"{"service":"weather"}"#),
                "/api/v1/auth/token" => ("200 OK", r#"{"jwt_token":"stub-token"}"#),
                "/api/data/weather" => (
                    "200 OK",
                    r#"{"data":{"temperature":21.5,"conditions":"clear","wind":{"speed":3.2}}}"#,
                ),
                "/api/data/forecast5" => (
                    "200 OK",
                    r#"[{"timestamp":"2024-06-15T09:00:00Z","value":19.0,"measurement_type":"temperature"},{"timestamp":"2024-06-15T15:00:00Z","value":25.0,"measurement_type":"temperature"},{"timestamp":"2024-06-16T09:00:00Z","value":17.5,"measurement_type":"temperature"}]"#,
                ),
                _ => ("404 Not Found", r#"{"detail":"not found"}"#),
            };
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

pub fn config_toml(base_url: &str) -> String {
    format!(
        r#"
[ndvi]
thresholds = [0.2, 0.4, 0.6]

[camera]
profile = "test-multispectral"
bands = {{ red = 0, nir = 1, green = 2 }}

[grid]
rows = 2
cols = 2

[resize]
max_dimension = 32

[orthophoto]
heartbeat_secs = 1

[weather]
base_url = "{base_url}"
probe_timeout_ms = 200
poll_interval_ms = 20
startup_timeout_secs = 1
request_timeout_secs = 2

[location]
lat = 39.36
lon = 22.94
name = "North field"
"#
    )
}

/// A project directory with two raw images and a config file.
pub struct Project {
    pub dir: tempfile::TempDir,
}

impl Project {
    pub fn new(base_url: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("data/images_full");
        fs::create_dir_all(&raw).unwrap();
        for (i, name) in ["IMG_0001.png", "IMG_0002.png"].iter().enumerate() {
            let img = RgbaImage::from_pixel(64, 48, Rgba([40 + i as u8, 180, 20, 255]));
            img.save(raw.join(name)).unwrap();
        }
        fs::write(dir.path().join("agrivision.toml"), config_toml(base_url)).unwrap();
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn config(&self, skip: SkipFlags) -> RunConfig {
        agrivision_core::config::load(&self.path("agrivision.toml"))
            .unwrap()
            .with_skips(skip)
    }

    pub fn pipeline(&self, skip: SkipFlags, engine: Arc<dyn PhotogrammetryEngine>) -> Pipeline {
        Pipeline::new(self.root(), self.config(skip))
            .with_engine(engine)
            .with_launcher(Arc::new(RecordingLauncher::default()))
            .with_architecture(Architecture::Unknown("test".to_string()))
    }
}
