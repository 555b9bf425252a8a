//! Weather service integration against a loopback HTTP stub.

mod common;

use std::fs;
use std::sync::Arc;

use std::time::{Duration, Instant};

use agrivision_core::report::{FORECAST_PLACEHOLDER, WEATHER_PLACEHOLDER};
use agrivision_core::{PipelineWarning, SkipFlags, WeatherSettings};
use agrivision_pipeline::weather::LaunchMarker;
use agrivision_pipeline::{Architecture, Pipeline, RunOptions, WeatherService};
use common::{closed_port, FakeEngine, HangingLauncher, Project, RecordingLauncher, StubWeather};
use serde_json::json;

fn settings(base_url: &str) -> WeatherSettings {
    let mut settings = agrivision_core::RunConfig::from_toml_str(&common::config_toml(base_url))
        .unwrap()
        .weather;
    settings.startup_timeout_secs = 1;
    settings
}

fn write_compose_files(project: &Project) {
    let dir = project.path("OpenAgri-WeatherService");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("docker-compose-x86_64.yml"), "services: {}\n").unwrap();
    fs::write(dir.join("docker-compose-arm64.yml"), "services: {}\n").unwrap();
}

#[tokio::test]
async fn test_reachable_service_is_fetched_without_launch() {
    let stub = StubWeather::start().await;
    let project = Project::new(&stub.base_url);
    let settings = settings(&stub.base_url);
    let launcher = Arc::new(RecordingLauncher::default());

    let service = WeatherService::new(
        &settings,
        None,
        project.root(),
        project.path(".agrivision/weather-start.marker"),
        Architecture::X86_64,
        launcher.clone(),
    );
    let snapshot = service.ensure_ready_and_fetch().await.unwrap();

    assert_eq!(snapshot.fields["temperature"], json!(21.5));
    assert_eq!(snapshot.fields["wind"], json!({"speed": 3.2}));
    let forecast = snapshot.forecast.expect("forecast missing");
    assert_eq!(forecast.daily_averages().len(), 2);
    assert_eq!(launcher.launch_count(), 0);
    assert!(!project.path(".agrivision/weather-start.marker").exists());
}

#[tokio::test]
async fn test_credentials_use_bearer_token() {
    let stub = StubWeather::start().await;
    let project = Project::new(&stub.base_url);
    let mut settings = settings(&stub.base_url);
    settings.username = Some("farmer".to_string());
    settings.password = Some("secret".to_string());
    let location = agrivision_core::Location {
        lat: 39.36,
        lon: 22.94,
        name: None,
    };

    let service = WeatherService::new(
        &settings,
        Some(&location),
        project.root(),
        project.path(".agrivision/weather-start.marker"),
        Architecture::X86_64,
        Arc::new(RecordingLauncher::default()),
    );
    service.ensure_ready_and_fetch().await.unwrap();

    let requests = stub.requests();
    let token = requests
        .iter()
        .find(|r| r.starts_with("POST /api/v1/auth/token"))
        .expect("no token request");
    assert!(token.contains("username=farmer"));
    let weather = requests
        .iter()
        .find(|r| r.starts_with("GET /api/data/weather"))
        .expect("no weather request");
    assert!(weather.contains("lat=39.36"));
    assert!(weather.to_lowercase().contains("authorization: bearer stub-token"));
    let forecast = requests
        .iter()
        .find(|r| r.starts_with("GET /api/data/forecast5"))
        .expect("no forecast request");
    assert!(forecast.contains("lon=22.94"));
    assert!(forecast.to_lowercase().contains("authorization: bearer stub-token"));
    assert_eq!(
        requests
            .iter()
            .filter(|r| r.starts_with("POST /api/v1/auth/token"))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_unreachable_service_is_launched_then_times_out() {
    let base_url = format!("http://127.0.0.1:{}", closed_port().await);
    let project = Project::new(&base_url);
    write_compose_files(&project);
    let settings = settings(&base_url);
    let launcher = Arc::new(RecordingLauncher::default());
    let marker = project.path(".agrivision/weather-start.marker");

    let service = WeatherService::new(
        &settings,
        None,
        project.root(),
        marker.clone(),
        Architecture::Arm64,
        launcher.clone(),
    );
    let err = service.ensure_ready_and_fetch().await.unwrap_err();
    assert!(err.contains("not ready"), "{err}");
    assert_eq!(launcher.launch_count(), 1);
    assert!(marker.is_file());
    assert_eq!(
        launcher.launches.lock().unwrap()[0].args[2],
        "docker-compose-arm64.yml"
    );
}

#[tokio::test]
async fn test_hanging_start_command_is_bounded_by_startup_timeout() {
    let base_url = format!("http://127.0.0.1:{}", closed_port().await);
    let project = Project::new(&base_url);
    write_compose_files(&project);
    let settings = settings(&base_url);
    let launcher = Arc::new(HangingLauncher::default());

    let service = WeatherService::new(
        &settings,
        None,
        project.root(),
        project.path(".agrivision/weather-start.marker"),
        Architecture::X86_64,
        launcher.clone(),
    );
    let started = Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(5), service.ensure_ready_and_fetch())
        .await
        .expect("weather startup was not bounded");

    let err = result.unwrap_err();
    assert!(err.contains("did not finish within 1s"), "{err}");
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(launcher.launches.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fresh_launch_marker_suppresses_relaunch() {
    let base_url = format!("http://127.0.0.1:{}", closed_port().await);
    let project = Project::new(&base_url);
    write_compose_files(&project);
    let mut settings = settings(&base_url);
    settings.startup_timeout_secs = 30;
    settings.poll_interval_ms = 10;
    let marker = project.path(".agrivision/weather-start.marker");
    fs::create_dir_all(marker.parent().unwrap()).unwrap();
    let recent = LaunchMarker {
        launched_at: chrono::Utc::now(),
        architecture: Architecture::X86_64,
    };
    fs::write(&marker, serde_json::to_vec(&recent).unwrap()).unwrap();
    let launcher = Arc::new(RecordingLauncher::default());

    let service = WeatherService::new(
        &settings,
        None,
        project.root(),
        marker,
        Architecture::X86_64,
        launcher.clone(),
    );
    let waited = tokio::time::timeout(
        std::time::Duration::from_millis(300),
        service.ensure_ready_and_fetch(),
    )
    .await;
    assert!(waited.is_err(), "should still be polling");
    assert_eq!(launcher.launch_count(), 0);
}

#[tokio::test]
async fn test_launched_service_becomes_ready() {
    let port = closed_port().await;
    let base_url = format!("http://127.0.0.1:{port}");
    let project = Project::new(&base_url);
    write_compose_files(&project);
    let mut settings = settings(&base_url);
    settings.startup_timeout_secs = 5;
    let launcher = Arc::new(RecordingLauncher {
        start_stub_on: Some(port),
        ..RecordingLauncher::default()
    });

    let service = WeatherService::new(
        &settings,
        None,
        project.root(),
        project.path(".agrivision/weather-start.marker"),
        Architecture::X86_64,
        launcher.clone(),
    );
    let snapshot = service.ensure_ready_and_fetch().await.unwrap();
    assert_eq!(snapshot.fields["conditions"], json!("clear"));
    assert_eq!(launcher.launch_count(), 1);
}

#[tokio::test]
async fn test_unknown_architecture_skips_startup() {
    let base_url = format!("http://127.0.0.1:{}", closed_port().await);
    let project = Project::new(&base_url);
    write_compose_files(&project);
    let settings = settings(&base_url);
    let launcher = Arc::new(RecordingLauncher::default());

    let service = WeatherService::new(
        &settings,
        None,
        project.root(),
        project.path(".agrivision/weather-start.marker"),
        Architecture::Unknown("s390x".to_string()),
        launcher.clone(),
    );
    let err = service.ensure_ready_and_fetch().await.unwrap_err();
    assert!(err.contains("s390x"));
    assert_eq!(launcher.launch_count(), 0);
}

#[tokio::test]
async fn test_report_includes_weather_snapshot() {
    let stub = StubWeather::start().await;
    let project = Project::new(&stub.base_url);
    let pipeline = project.pipeline(SkipFlags::none(), Arc::new(FakeEngine::default()));

    let outcome = pipeline
        .run(RunOptions {
            run_id: Some("with-weather".to_string()),
            ..RunOptions::default()
        })
        .await
        .unwrap();

    assert!(outcome.is_done(), "error: {:?}", outcome.error);
    assert!(outcome.run.warnings.is_empty());
    let report = fs::read_to_string(project.path("output/reports/report_latest.html")).unwrap();
    assert!(!report.contains(WEATHER_PLACEHOLDER));
    assert!(report.contains("<th>temperature</th><td>21.5</td>"));
    assert!(report.contains("{&quot;speed&quot;:3.2}"));
    assert!(!report.contains(FORECAST_PLACEHOLDER));
    assert!(report.contains("<tr><td>2024-06-15</td><td>22.0</td><td>2</td></tr>"));
    assert!(report.contains("<tr><td>2024-06-16</td><td>17.5</td><td>1</td></tr>"));
}

#[tokio::test]
async fn test_no_weather_option_uses_placeholder() {
    let stub = StubWeather::start().await;
    let project = Project::new(&stub.base_url);
    let pipeline: Pipeline = project.pipeline(SkipFlags::none(), Arc::new(FakeEngine::default()));

    let outcome = pipeline
        .run(RunOptions {
            run_id: Some("offline".to_string()),
            no_weather: true,
            ..RunOptions::default()
        })
        .await
        .unwrap();

    assert!(outcome.is_done());
    assert!(matches!(
        outcome.run.warnings.as_slice(),
        [PipelineWarning::WeatherUnavailable(_)]
    ));
    assert!(stub.requests().is_empty());
    let report = fs::read_to_string(project.path("output/reports/report_latest.html")).unwrap();
    assert!(report.contains(WEATHER_PLACEHOLDER));
    assert!(report.contains(FORECAST_PLACEHOLDER));
}

#[tokio::test]
async fn test_unreachable_service_for_full_window_still_finishes_run() {
    let base_url = format!("http://127.0.0.1:{}", closed_port().await);
    let project = Project::new(&base_url);
    write_compose_files(&project);
    let launcher = Arc::new(RecordingLauncher::default());
    let pipeline = Pipeline::new(project.root(), project.config(SkipFlags::none()))
        .with_engine(Arc::new(FakeEngine::default()))
        .with_launcher(launcher.clone())
        .with_architecture(Architecture::X86_64);

    let outcome = pipeline
        .run(RunOptions {
            run_id: Some("weather-down".to_string()),
            ..RunOptions::default()
        })
        .await
        .unwrap();

    assert!(outcome.is_done(), "error: {:?}", outcome.error);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(launcher.launch_count(), 1);
    assert_eq!(
        launcher.launches.lock().unwrap()[0].args[2],
        "docker-compose-x86_64.yml"
    );
    match outcome.run.warnings.as_slice() {
        [PipelineWarning::WeatherUnavailable(reason)] => {
            assert!(reason.contains("not ready"), "{reason}")
        }
        other => panic!("unexpected warnings: {other:?}"),
    }
    assert!(project.path(".agrivision/weather-start.marker").is_file());
    let report = fs::read_to_string(project.path("output/reports/report_latest.html")).unwrap();
    assert!(report.contains(WEATHER_PLACEHOLDER));
}
