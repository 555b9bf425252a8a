//! Weather service integration.
//!
//! [`WeatherService::ensure_ready_and_fetch`] is the single entry point: probe
//! the service, start it for the host architecture when it is down, wait for
//! it, then fetch one snapshot. Every failure is reported as a reason string
//! so the caller can record a warning and carry on.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use agrivision_core::artifact::write_atomic;
use agrivision_core::{Forecast, Location, WeatherSettings, WeatherSnapshot};

use crate::process::run_supervised;

/// Host CPU architecture class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Architecture {
    X86_64,
    Arm64,
    Unknown(String),
}

impl Architecture {
    pub fn detect() -> Self {
        Self::from_arch(std::env::consts::ARCH)
    }

    pub fn from_arch(arch: &str) -> Self {
        match arch {
            "x86_64" | "x86" => Architecture::X86_64,
            "aarch64" | "arm" => Architecture::Arm64,
            other => Architecture::Unknown(other.to_string()),
        }
    }
}

/// How to start the service on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupRecipe {
    pub working_dir: PathBuf,
    pub program: String,
    pub args: Vec<String>,
}

impl StartupRecipe {
    /// `docker compose -f <file> up -d` in the service directory.
    pub fn for_architecture(
        arch: &Architecture,
        settings: &WeatherSettings,
        project_root: &Path,
    ) -> Result<Self, String> {
        let compose_file = match arch {
            Architecture::X86_64 => &settings.compose_x86_64,
            Architecture::Arm64 => &settings.compose_arm64,
            Architecture::Unknown(name) => {
                return Err(format!("no startup recipe for architecture '{name}'"))
            }
        };
        let working_dir = project_root.join(&settings.service_dir);
        if !working_dir.is_dir() {
            return Err(format!(
                "weather service directory {} not found",
                working_dir.display()
            ));
        }
        if !working_dir.join(compose_file).is_file() {
            return Err(format!(
                "compose file {compose_file} not found in {}",
                working_dir.display()
            ));
        }
        Ok(Self {
            working_dir,
            program: "docker".to_string(),
            args: vec![
                "compose".to_string(),
                "-f".to_string(),
                compose_file.clone(),
                "up".to_string(),
                "-d".to_string(),
            ],
        })
    }
}

#[async_trait]
pub trait ServiceLauncher: Send + Sync {
    /// Start the service. Returns once the start command has finished.
    async fn launch(&self, recipe: &StartupRecipe) -> Result<(), String>;
}

/// Runs the recipe as a local process.
pub struct ComposeLauncher;

#[async_trait]
impl ServiceLauncher for ComposeLauncher {
    async fn launch(&self, recipe: &StartupRecipe) -> Result<(), String> {
        let mut command = Command::new(&recipe.program);
        command.args(&recipe.args).current_dir(&recipe.working_dir);
        let outcome = run_supervised(command, "weather-service", Duration::from_secs(15))
            .await
            .map_err(|e| format!("failed to run {}: {e}", recipe.program))?;
        if outcome.success() {
            Ok(())
        } else {
            Err(format!(
                "service start exited with {}: {}",
                outcome.status,
                outcome.stderr_tail.lines().last().unwrap_or_default()
            ))
        }
    }
}

/// Record of the last launch attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchMarker {
    pub launched_at: DateTime<Utc>,
    pub architecture: Architecture,
}

/// HTTP client for the weather service API.
#[derive(Debug, Clone)]
pub struct WeatherClient {
    http: reqwest::Client,
    base_url: String,
    probe_timeout: Duration,
}

#[derive(Deserialize)]
struct TokenResponse {
    jwt_token: String,
}

impl WeatherClient {
    pub fn new(settings: &WeatherSettings) -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| format!("cannot build http client: {e}"))?;
        Ok(Self {
            http,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            probe_timeout: Duration::from_millis(settings.probe_timeout_ms),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Any HTTP response counts as reachable.
    pub async fn probe(&self) -> bool {
        match self
            .http
            .get(self.url("/"))
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(resp) => {
                debug!(status = %resp.status(), "Weather service answered probe");
                true
            }
            Err(e) => {
                debug!(error = %e, "Weather service probe failed");
                false
            }
        }
    }

    async fn token(&self, username: &str, password: &str) -> Result<String, String> {
        let resp = self
            .http
            .post(self.url("/api/v1/auth/token"))
            .form(&[("username", username), ("password", password)])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| format!("token request failed: {e}"))?;
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| format!("token response malformed: {e}"))?;
        Ok(body.jwt_token)
    }

    /// Exchange credentials for a bearer token. No credentials, no token.
    pub async fn authenticate(
        &self,
        credentials: Option<(&str, &str)>,
    ) -> Result<Option<String>, String> {
        match credentials {
            Some((user, pass)) => self.token(user, pass).await.map(Some),
            None => Ok(None),
        }
    }

    async fn get_json(
        &self,
        path: &str,
        location: Option<&Location>,
        token: Option<&str>,
    ) -> Result<Value, String> {
        let mut request = self.http.get(self.url(path));
        if let Some(loc) = location {
            request = request.query(&[("lat", loc.lat), ("lon", loc.lon)]);
        }
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| format!("request to {path} failed: {e}"))?
            .json()
            .await
            .map_err(|e| format!("response from {path} is not JSON: {e}"))
    }

    /// Fetch current conditions.
    pub async fn fetch(
        &self,
        location: Option<&Location>,
        token: Option<&str>,
    ) -> Result<WeatherSnapshot, String> {
        let payload = self.get_json("/api/data/weather", location, token).await?;
        WeatherSnapshot::from_payload(payload)
    }

    /// Fetch the 5-day forecast.
    pub async fn fetch_forecast(
        &self,
        location: Option<&Location>,
        token: Option<&str>,
    ) -> Result<Forecast, String> {
        let payload = self.get_json("/api/data/forecast5", location, token).await?;
        Forecast::from_payload(payload)
    }
}

/// The "ensure weather service ready" operation for one project.
pub struct WeatherService<'a> {
    settings: &'a WeatherSettings,
    location: Option<&'a Location>,
    project_root: &'a Path,
    marker_path: PathBuf,
    architecture: Architecture,
    launcher: Arc<dyn ServiceLauncher>,
}

impl<'a> WeatherService<'a> {
    pub fn new(
        settings: &'a WeatherSettings,
        location: Option<&'a Location>,
        project_root: &'a Path,
        marker_path: PathBuf,
        architecture: Architecture,
        launcher: Arc<dyn ServiceLauncher>,
    ) -> Self {
        Self {
            settings,
            location,
            project_root,
            marker_path,
            architecture,
            launcher,
        }
    }

    fn recent_launch(&self) -> Option<LaunchMarker> {
        let bytes = fs::read(&self.marker_path).ok()?;
        let marker: LaunchMarker = serde_json::from_slice(&bytes).ok()?;
        let age = Utc::now().signed_duration_since(marker.launched_at);
        (age.num_seconds() < self.settings.startup_timeout_secs as i64).then_some(marker)
    }

    fn record_launch(&self) {
        let marker = LaunchMarker {
            launched_at: Utc::now(),
            architecture: self.architecture.clone(),
        };
        let written = serde_json::to_vec_pretty(&marker)
            .map_err(std::io::Error::from)
            .and_then(|json| write_atomic(&self.marker_path, &json));
        if let Err(e) = written {
            warn!(path = %self.marker_path.display(), error = %e, "Failed to write weather launch marker");
        }
    }

    async fn launch_before(&self, recipe: &StartupRecipe, deadline: Instant) -> Result<(), String> {
        match tokio::time::timeout_at(deadline, self.launcher.launch(recipe)).await {
            Ok(result) => result,
            Err(_) => Err(format!(
                "service start did not finish within {}s",
                self.settings.startup_timeout_secs
            )),
        }
    }

    async fn wait_until_ready(&self, client: &WeatherClient, deadline: Instant) -> Result<(), String> {
        let interval = Duration::from_millis(self.settings.poll_interval_ms.max(1));
        loop {
            if Instant::now() >= deadline {
                return Err(format!(
                    "service not ready after {}s",
                    self.settings.startup_timeout_secs
                ));
            }
            tokio::time::sleep(interval.min(deadline.saturating_duration_since(Instant::now())))
                .await;
            if let Ok(true) = tokio::time::timeout_at(deadline, client.probe()).await {
                return Ok(());
            }
        }
    }

    /// Make sure the service runs, then fetch one snapshot with its forecast.
    ///
    /// Starting and waiting for the service share one `startup_timeout_secs`
    /// budget. A missing forecast is logged and leaves `forecast` empty.
    pub async fn ensure_ready_and_fetch(&self) -> Result<WeatherSnapshot, String> {
        let client = WeatherClient::new(self.settings)?;

        if !client.probe().await {
            let deadline =
                Instant::now() + Duration::from_secs(self.settings.startup_timeout_secs);
            info!(url = %self.settings.base_url, arch = ?self.architecture, "Weather service not reachable");
            match self.recent_launch() {
                Some(marker) => {
                    info!(launched_at = %marker.launched_at, "Service start already in progress, waiting");
                }
                None => {
                    let recipe = StartupRecipe::for_architecture(
                        &self.architecture,
                        self.settings,
                        self.project_root,
                    )?;
                    info!(dir = %recipe.working_dir.display(), args = ?recipe.args, "Starting weather service");
                    self.record_launch();
                    self.launch_before(&recipe, deadline).await?;
                }
            }
            self.wait_until_ready(&client, deadline).await?;
        }

        let credentials = match (&self.settings.username, &self.settings.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        };
        let token = client.authenticate(credentials).await?;
        let mut snapshot = client.fetch(self.location, token.as_deref()).await?;
        match client.fetch_forecast(self.location, token.as_deref()).await {
            Ok(forecast) => {
                info!(points = forecast.items.len(), "Weather forecast fetched");
                snapshot.forecast = Some(forecast);
            }
            Err(reason) => warn!(reason = %reason, "Weather forecast unavailable"),
        }
        info!(fields = snapshot.fields.len(), "Weather snapshot fetched");
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> WeatherSettings {
        WeatherSettings {
            base_url: "http://127.0.0.1:9".to_string(),
            probe_timeout_ms: 50,
            poll_interval_ms: 10,
            startup_timeout_secs: 60,
            request_timeout_secs: 1,
            service_dir: PathBuf::from("OpenAgri-WeatherService"),
            compose_x86_64: "docker-compose-x86_64.yml".to_string(),
            compose_arm64: "docker-compose-arm64.yml".to_string(),
            username: None,
            password: None,
        }
    }

    #[test]
    fn test_architecture_classes() {
        assert_eq!(Architecture::from_arch("x86_64"), Architecture::X86_64);
        assert_eq!(Architecture::from_arch("x86"), Architecture::X86_64);
        assert_eq!(Architecture::from_arch("aarch64"), Architecture::Arm64);
        assert_eq!(Architecture::from_arch("arm"), Architecture::Arm64);
        assert_eq!(
            Architecture::from_arch("riscv64"),
            Architecture::Unknown("riscv64".to_string())
        );
    }

    #[test]
    fn test_recipe_selects_compose_file_per_arch() {
        let dir = tempfile::tempdir().unwrap();
        let service = dir.path().join("OpenAgri-WeatherService");
        fs::create_dir_all(&service).unwrap();
        fs::write(service.join("docker-compose-x86_64.yml"), "services: {}").unwrap();
        fs::write(service.join("docker-compose-arm64.yml"), "services: {}").unwrap();

        let x86 = StartupRecipe::for_architecture(&Architecture::X86_64, &settings(), dir.path())
            .unwrap();
        assert_eq!(x86.args, vec!["compose", "-f", "docker-compose-x86_64.yml", "up", "-d"]);
        assert_eq!(x86.working_dir, service);

        let arm = StartupRecipe::for_architecture(&Architecture::Arm64, &settings(), dir.path())
            .unwrap();
        assert_eq!(arm.args[2], "docker-compose-arm64.yml");
    }

    #[test]
    fn test_unknown_arch_has_no_recipe() {
        let dir = tempfile::tempdir().unwrap();
        let err = StartupRecipe::for_architecture(
            &Architecture::Unknown("mips".to_string()),
            &settings(),
            dir.path(),
        )
        .unwrap_err();
        assert!(err.contains("mips"));
    }

    #[test]
    fn test_missing_service_dir_has_no_recipe() {
        let dir = tempfile::tempdir().unwrap();
        let err = StartupRecipe::for_architecture(&Architecture::X86_64, &settings(), dir.path())
            .unwrap_err();
        assert!(err.contains("not found"));
    }
}
