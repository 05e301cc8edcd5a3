//! HTTP route handlers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::{MAX_TIMEOUT, MIN_CONVERSION_TIMEOUT, check_conversion_timeout};
use crate::registry::ConversionState;
use crate::service::{
    ConversionRequest, ConversionResult, ConversionService, ConvertError, ErrorKind,
    HealthSnapshot,
};

#[derive(Debug, Deserialize)]
pub struct ConvertBody {
    pub id: Option<String>,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub timeout_secs: Option<f64>,
}

fn status_for(kind: Option<ErrorKind>) -> StatusCode {
    match kind {
        None => StatusCode::OK,
        Some(ErrorKind::DeterministicContentError) => StatusCode::UNPROCESSABLE_ENTITY,
        Some(ErrorKind::TransientResourceError) => StatusCode::BAD_GATEWAY,
        Some(ErrorKind::PoolExhausted | ErrorKind::BreakerOpen | ErrorKind::Unavailable) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        Some(ErrorKind::Timeout) => StatusCode::GATEWAY_TIMEOUT,
        Some(ErrorKind::Cancelled | ErrorKind::InvalidRequest) => StatusCode::CONFLICT,
    }
}

fn parse_timeout(secs: f64) -> Result<Duration, String> {
    let timeout = Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())?;
    check_conversion_timeout(timeout).map_err(|_| {
        format!(
            "timeout must be between {}s and {}s",
            MIN_CONVERSION_TIMEOUT.as_secs_f64(),
            MAX_TIMEOUT.as_secs()
        )
    })
}

async fn health_check(State(service): State<Arc<ConversionService>>) -> Json<HealthSnapshot> {
    service.check_availability().await;
    Json(service.health())
}

async fn convert(
    State(service): State<Arc<ConversionService>>,
    Json(body): Json<ConvertBody>,
) -> impl IntoResponse {
    let timeout = match body.timeout_secs.map(parse_timeout).transpose() {
        Ok(timeout) => timeout,
        Err(msg) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(serde_json::json!({
                    "detail": [{
                        "loc": ["body", "timeout_secs"],
                        "msg": msg,
                        "type": "value_error"
                    }]
                })),
            );
        }
    };

    let started = Instant::now();
    let request_id = body
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let request = ConversionRequest {
        id: Some(request_id.clone()),
        input_path: body.input_path,
        output_path: body.output_path,
        timeout,
    };

    // The conversion runs in its own task so the lease is settled even if the
    // client disconnects. Disconnecting drops the guard, which cancels it.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let service_bg = Arc::clone(&service);
    let outcome = match tokio::spawn(async move { service_bg.convert(request, cancel).await })
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => Err(ConvertError::Transient {
            message: format!("conversion task lost: {}", e),
            code: None,
        }),
    };
    guard.disarm();

    let result = ConversionResult::from_outcome(request_id, &outcome, started.elapsed());
    (status_for(result.error_kind), Json(serde_json::json!(result)))
}

async fn list_conversions(
    State(service): State<Arc<ConversionService>>,
) -> Json<Vec<ConversionState>> {
    Json(service.registry().list())
}

async fn cancel_conversion(
    State(service): State<Arc<ConversionService>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    if service.cancel(&id) {
        (StatusCode::OK, Json(serde_json::json!({})))
    } else {
        (StatusCode::NOT_FOUND, Json(serde_json::json!({})))
    }
}

async fn shutdown(State(service): State<Arc<ConversionService>>) -> impl IntoResponse {
    tracing::info!("Shutdown requested via HTTP");
    service.trigger_shutdown();
    (StatusCode::OK, Json(serde_json::json!({})))
}

pub fn routes(service: Arc<ConversionService>) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/shutdown", post(shutdown))
        .route("/convert", post(convert))
        .route("/conversions", get(list_conversions))
        .route("/conversions/{id}/cancel", post(cancel_conversion))
        .with_state(service)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::backend::{DocumentKind, codes};
    use crate::breaker::BreakerConfig;
    use crate::config::ConvertConfig;
    use crate::test_support::{FakeFactory, RecordingReaper, Step};

    struct Fixture {
        service: Arc<ConversionService>,
        factory: Arc<FakeFactory>,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn body(&self, input: &str, output: &str) -> serde_json::Value {
            let input_path = self.dir.path().join(input);
            std::fs::write(&input_path, b"document body").unwrap();
            serde_json::json!({
                "input_path": input_path,
                "output_path": self.dir.path().join(output),
            })
        }

        async fn post(&self, uri: &str, body: serde_json::Value) -> axum::response::Response {
            routes(Arc::clone(&self.service))
                .oneshot(
                    Request::post(uri)
                        .header("content-type", "application/json")
                        .body(Body::from(body.to_string()))
                        .unwrap(),
                )
                .await
                .unwrap()
        }

        async fn get(&self, uri: &str) -> axum::response::Response {
            routes(Arc::clone(&self.service))
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap()
        }
    }

    fn fixture(config: ConvertConfig) -> Fixture {
        let factory = FakeFactory::new();
        let service =
            ConversionService::new(config, factory.clone(), RecordingReaper::new()).unwrap();
        Fixture {
            service: Arc::new(service),
            factory,
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn config() -> ConvertConfig {
        ConvertConfig::default()
            .with_pool_sizes(1, 1)
            .with_acquire_timeout(Duration::from_secs(2))
            .with_launch_retry(1, Duration::from_millis(10))
    }

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_check_returns_status_and_version() {
        let f = fixture(config());

        let response = f.get("/health-check").await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["status"], "READY");
        assert_eq!(json["available"], true);
        assert_eq!(json["version"]["backend"], "fake");
        assert!(json["version"]["docpress"].is_string());
        assert_eq!(json["breakers"][0]["state"], "closed");
        assert_eq!(json["pools"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn convert_success() {
        let f = fixture(config());
        let mut body = f.body("report.docx", "report.pdf");
        body["id"] = serde_json::json!("req-1");

        let response = f.post("/convert", body).await;
        assert_eq!(response.status(), StatusCode::OK);

        let json = response_json(response).await;
        assert_eq!(json["request_id"], "req-1");
        assert_eq!(json["success"], true);
        assert!(json.get("error_kind").is_none());
        assert!(f.dir.path().join("report.pdf").is_file());
    }

    #[tokio::test]
    async fn convert_unsupported_type_is_422() {
        let f = fixture(config());

        let response = f.post("/convert", f.body("slides.pptx", "slides.pdf")).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let json = response_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["error_kind"], "deterministic_content_error");
    }

    #[tokio::test]
    async fn convert_missing_output_dir_is_409() {
        let f = fixture(config());
        let mut body = f.body("a.docx", "a.pdf");
        body["output_path"] = serde_json::json!(f.dir.path().join("nope").join("a.pdf"));

        let response = f.post("/convert", body).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response_json(response).await["error_kind"], "invalid_request");
    }

    #[tokio::test]
    async fn transient_failure_then_breaker_open() {
        let f = fixture(
            config().with_office_breaker(BreakerConfig::generic().with_failure_threshold(1)),
        );
        f.factory.script_export([Step::Fail(codes::RPC_S_SERVER_UNAVAILABLE)]);

        let response = f.post("/convert", f.body("a.docx", "a.pdf")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response_json(response).await["error_kind"],
            "transient_resource_error"
        );

        let response = f.post("/convert", f.body("b.docx", "b.pdf")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response_json(response).await["error_kind"], "breaker_open");
        assert_eq!(f.factory.exports(), 1);
    }

    #[tokio::test]
    async fn convert_timeout_is_504() {
        let f = fixture(config());
        f.factory.script_export([Step::Sleep(Duration::from_millis(300))]);
        let mut body = f.body("slow.xlsx", "slow.pdf");
        body["timeout_secs"] = serde_json::json!(0.05);

        let response = f.post("/convert", body).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response_json(response).await["error_kind"], "timeout");
    }

    #[tokio::test]
    async fn negative_timeout_rejected() {
        let f = fixture(config());
        let mut body = f.body("a.docx", "a.pdf");
        body["timeout_secs"] = serde_json::json!(-1.0);

        let response = f.post("/convert", body).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(
            response_json(response).await["detail"][0]["loc"][1],
            "timeout_secs"
        );
        assert_eq!(f.factory.launches(), 0);
    }

    #[tokio::test]
    async fn out_of_range_timeouts_rejected() {
        let f = fixture(config());

        for secs in [0.0, 0.001, 1e18, 1e300] {
            let mut body = f.body("a.docx", "a.pdf");
            body["timeout_secs"] = serde_json::json!(secs);

            let response = f.post("/convert", body).await;
            assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY, "{}", secs);
            let json = response_json(response).await;
            assert_eq!(json["detail"][0]["loc"][1], "timeout_secs");
            assert_eq!(json["detail"][0]["type"], "value_error");
        }

        assert_eq!(f.factory.launches(), 0);
        assert_eq!(f.factory.availability_checks(), 0);
        let breaker = f.service.breaker(DocumentKind::WordProcessor).snapshot();
        assert_eq!(breaker.failures, 0);
    }

    #[tokio::test]
    async fn cancel_unknown_conversion_is_404() {
        let f = fixture(config());
        let response = f.post("/conversions/missing/cancel", serde_json::json!({})).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_conversions_when_idle() {
        let f = fixture(config());
        let response = f.get("/conversions").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response_json(response).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn shutdown_signals_service() {
        let f = fixture(config());
        let rx = f.service.shutdown_rx();
        assert!(!*rx.borrow());

        let response = f.post("/shutdown", serde_json::json!({})).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(*rx.borrow());

        let response = f.post("/convert", f.body("late.docx", "late.pdf")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
