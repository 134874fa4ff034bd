//! HTTP control surface.

mod error;
mod routes;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::avatar::BlobStore;
use crate::config::SupervisorConfig;
use crate::orchestrator::AvatarOrchestrator;
use crate::supervisor::{OsPlatform, Platform};

pub use error::ApiError;

/// Uploads are whole training videos.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

pub struct AppState<P: Platform = OsPlatform> {
    pub orchestrator: AvatarOrchestrator<P>,
    pub store: BlobStore,
}

pub fn router<P: Platform>(state: Arc<AppState<P>>) -> Router {
    Router::new()
        .route("/health", get(routes::health::<P>))
        .route("/avatars", get(routes::avatars::<P>))
        .route("/start", post(routes::start::<P>))
        .route("/stop", post(routes::stop::<P>))
        .route("/train", post(routes::train::<P>))
        .route("/status/{name}", get(routes::status::<P>))
        .route("/jobs/{name}", delete(routes::remove_job::<P>))
        .route(
            "/upload/{kind}",
            post(routes::upload::<P>).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Runs the API until Ctrl-C or SIGTERM, then stops every supervised job.
pub async fn serve(config: SupervisorConfig) -> Result<()> {
    let bind = config.bind.clone();
    let store = BlobStore::new(&config.upload_dir);
    let orchestrator = AvatarOrchestrator::new(config);
    let state = Arc::new(AppState {
        orchestrator: orchestrator.clone(),
        store,
    });

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(address = %bind, "control API listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutting down, stopping supervised jobs");
    orchestrator.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        AvatarStatus, AvatarsResponse, ErrorResponse, HealthResponse, StartResponse,
        StopResponse, TrainResponse, UploadResponse,
    };
    use crate::supervisor::SupervisorSettings;
    use crate::supervisor::testing::{FakeBehavior, FakePlatform};
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use serde::de::DeserializeOwned;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Fixture {
        dir: TempDir,
        platform: FakePlatform,
        state: Arc<AppState<FakePlatform>>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = SupervisorConfig {
            tool_root: dir.path().join("tool"),
            upload_dir: dir.path().join("uploads"),
            logs_dir: dir.path().join("logs"),
            ..SupervisorConfig::default()
        };
        let settings = SupervisorSettings {
            startup_grace: Duration::from_millis(50),
            stop_grace: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
            training_timeout: Some(Duration::from_secs(5)),
            serving_timeout: None,
            log_tail_lines: 5,
        };
        let platform = FakePlatform::new();
        let store = BlobStore::new(&config.upload_dir);
        let orchestrator = AvatarOrchestrator::with_platform(config, platform.clone(), settings);
        Fixture {
            dir,
            platform,
            state: Arc::new(AppState {
                orchestrator,
                store,
            }),
        }
    }

    impl Fixture {
        fn publish(&self, id: &str) {
            let repo = self.state.orchestrator.repository();
            std::fs::create_dir_all(repo.published_path(id)).unwrap();
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>) {
            let response = router(self.state.clone()).oneshot(request).await.unwrap();
            let status = response.status();
            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            (status, body.to_vec())
        }

        async fn get<T: DeserializeOwned>(&self, uri: &str) -> (StatusCode, T) {
            let request = Request::get(uri).body(Body::empty()).unwrap();
            let (status, body) = self.send(request).await;
            (status, serde_json::from_slice(&body).unwrap())
        }

        async fn post<T: DeserializeOwned>(
            &self,
            uri: &str,
            json: serde_json::Value,
        ) -> (StatusCode, T) {
            let request = Request::post(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap();
            let (status, body) = self.send(request).await;
            (status, serde_json::from_slice(&body).unwrap())
        }
    }

    #[tokio::test]
    async fn health_reports_counts() {
        let f = fixture();
        f.publish("wav2lip256_anna");
        let (status, health): (_, HealthResponse) = f.get("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health.status, "ok");
        assert_eq!(health.avatars, 1);
        assert_eq!(health.running, 0);
        assert_eq!(health.training, 0);
    }

    #[tokio::test]
    async fn avatars_lists_published() {
        let f = fixture();
        f.publish("wav2lip256_bob");
        f.publish("wav2lip256_anna");
        let (status, body): (_, AvatarsResponse) = f.get("/avatars").await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body.avatars.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["anna", "bob"]);
    }

    #[tokio::test]
    async fn start_stop_round() {
        let f = fixture();
        f.publish("wav2lip256_anna");

        let (status, started): (_, StartResponse) = f
            .post("/start", serde_json::json!({"name": "anna", "ref_file": "a.wav"}))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(started.status, "running");
        assert_eq!(started.name, "wav2lip256_anna");
        assert_eq!(started.webrtc_url, "http://localhost:8010");

        let (status, err): (_, ErrorResponse) = f
            .post("/start", serde_json::json!({"name": "anna", "ref_file": "a.wav"}))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(err.error.contains("already running"));

        let (_, current): (_, AvatarStatus) = f.get("/status/anna").await;
        assert_eq!(current.state, "running");
        assert_eq!(current.pid, Some(started.pid));

        let (status, stopped): (_, StopResponse) =
            f.post("/stop", serde_json::json!({"name": "anna"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stopped.status, "stopped");
        assert_eq!(stopped.pid, Some(started.pid));

        let (_, again): (_, StopResponse) =
            f.post("/stop", serde_json::json!({"name": "anna"})).await;
        assert_eq!(again.status, "not_running");
        assert_eq!(f.platform.live_count(), 0);
    }

    #[tokio::test]
    async fn stop_is_ok_when_the_tree_resists() {
        let f = fixture();
        f.publish("wav2lip256_anna");
        f.platform.push(FakeBehavior::RefusesSignals);
        let (_, started): (_, StartResponse) = f
            .post("/start", serde_json::json!({"name": "anna", "ref_file": "a.wav"}))
            .await;

        let (status, stopped): (_, StopResponse) =
            f.post("/stop", serde_json::json!({"name": "anna"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stopped.status, "stopped");
        assert_eq!(stopped.pid, Some(started.pid));

        let (_, current): (_, AvatarStatus) = f.get("/status/anna").await;
        assert_eq!(current.state, "idle");
    }

    #[tokio::test]
    async fn start_unknown_avatar_is_404() {
        let f = fixture();
        let (status, err): (_, ErrorResponse) =
            f.post("/start", serde_json::json!({"name": "ghost"})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(err.error.contains("wav2lip256_ghost"));
    }

    #[tokio::test]
    async fn start_that_exits_during_grace_is_500() {
        let f = fixture();
        f.publish("wav2lip256_anna");
        f.platform.push(FakeBehavior::ExitsAfter { polls: 0, code: 1 });

        let (status, err): (_, ErrorResponse) = f
            .post("/start", serde_json::json!({"name": "anna", "ref_file": "a.wav"}))
            .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.error.contains("exited during startup"));

        let (_, current): (_, AvatarStatus) = f.get("/status/anna").await;
        assert_eq!(current.state, "idle");
        assert!(current.pid.is_none());
    }

    #[tokio::test]
    async fn train_is_accepted_then_conflicts() {
        let f = fixture();
        let video = f.dir.path().join("in.mp4");
        let audio = f.dir.path().join("in.wav");
        std::fs::write(&video, b"v").unwrap();
        std::fs::write(&audio, b"a").unwrap();
        let body = serde_json::json!({
            "name": "anna",
            "input_media_path": video,
            "reference_audio_path": audio,
            "reference_text": "hello",
        });

        let (status, accepted): (_, TrainResponse) = f.post("/train", body.clone()).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(accepted.status, "training_started");
        assert_eq!(accepted.name, "wav2lip256_anna");

        let (status, _): (_, ErrorResponse) = f.post("/train", body).await;
        assert_eq!(status, StatusCode::CONFLICT);
        f.state.orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn train_with_missing_media_is_400() {
        let f = fixture();
        let (status, err): (_, ErrorResponse) = f
            .post(
                "/train",
                serde_json::json!({
                    "name": "anna",
                    "input_media_path": "/nope.mp4",
                    "reference_audio_path": "/nope.wav",
                }),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(err.error.contains("input media not found"));
    }

    #[tokio::test]
    async fn status_of_unknown_is_not_found_state() {
        let f = fixture();
        let (status, body): (_, AvatarStatus) = f.get("/status/ghost").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.state, "not_found");
    }

    #[tokio::test]
    async fn delete_job_lifecycle() {
        let f = fixture();
        let request = || Request::delete("/jobs/anna").body(Body::empty()).unwrap();

        let (status, _) = f.send(request()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        f.publish("wav2lip256_anna");
        f.state
            .orchestrator
            .start_avatar("anna", Some("a.wav".into()), None)
            .await
            .unwrap();
        let (status, _) = f.send(request()).await;
        assert_eq!(status, StatusCode::CONFLICT);

        f.state.orchestrator.stop_avatar("anna").await.unwrap();
        let (status, body) = f.send(request()).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());
        assert!(f.state.orchestrator.supervisor().list_jobs().is_empty());
    }

    fn multipart(filename: &str, content: &[u8]) -> Request<Body> {
        let boundary = "X-AVATAR-BOUNDARY";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        Request::post("/upload/audio")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn upload_stores_file() {
        let f = fixture();
        let (status, body) = f.send(multipart("voice.wav", b"RIFFdata")).await;
        assert_eq!(status, StatusCode::OK);
        let uploaded: UploadResponse = serde_json::from_slice(&body).unwrap();
        assert!(uploaded.path.starts_with(f.dir.path().join("uploads/audio")));
        assert_eq!(std::fs::read(uploaded.path).unwrap(), b"RIFFdata");
    }

    #[tokio::test]
    async fn upload_with_wrong_extension_is_400() {
        let f = fixture();
        let (status, body) = f.send(multipart("voice.mp3", b"ID3")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let err: ErrorResponse = serde_json::from_slice(&body).unwrap();
        assert!(err.error.contains("voice.mp3"));
    }
}
