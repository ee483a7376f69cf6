use crate::{config::ServerConfig, explanation::Explainer, routes::api_routes, telemetry::Metrics};
use axum::{extract::DefaultBodyLimit, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use deepfake_detection::detector::Detector;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};
use tower_http::cors::CorsLayer;

#[derive(Clone)]
pub struct SharedState {
    pub detector: Arc<Detector>,
    pub explainer: Arc<Explainer>,
    pub metrics: Arc<Metrics>,
}

pub fn build_router(state: SharedState, max_upload_bytes: usize) -> Router {
    let metrics_layer = HttpMetricsLayerBuilder::new().build();

    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(metrics_layer)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(state: SharedState, config: &ServerConfig) -> anyhow::Result<Self> {
        let router = build_router(state, config.max_upload_bytes);
        let listener = TcpListener::bind(config.get_address()).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(self, mut shutdown_rx: Receiver<()>) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    shutdown_rx.recv().await.ok();
                })
                .await?;
            Ok(())
        });

        Ok(server_handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::LlmConfig, explanation::Intent, llm::ChatClient};
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use deepfake_detection::{
        classifier::{Classifier, InferenceError, PredictionRecord},
        config::Granularity,
        decoder::{DecodeError, FrameSelector, VideoDecoder},
        detector::ModelHandle,
        frame::{ChannelOrder, Frame},
        preprocess::Preprocessor,
        sampler::FrameSampler,
    };
    use image::{ImageBuffer, Rgb, RgbImage};
    use ndarray::ArrayViewD;
    use serde_json::{json, Value};
    use std::{io::Cursor, path::Path};
    use tower::ServiceExt;
    use wiremock::{
        matchers::{body_string_contains, path},
        Mock, MockServer, ResponseTemplate,
    };

    const BOUNDARY: &str = "deepfake-test-boundary";

    struct FixedClassifier(&'static str, f32);

    impl Classifier for FixedClassifier {
        fn classify(&self, _input: ArrayViewD<'_, f32>) -> Result<PredictionRecord, InferenceError> {
            Ok(PredictionRecord::new(self.0, self.1, vec![0.0, 1.0]))
        }
    }

    struct ThreeFrames;

    impl VideoDecoder for ThreeFrames {
        fn frame_count(&self, _path: &Path) -> Result<usize, DecodeError> {
            Ok(3)
        }

        fn decode_frames(&self, _path: &Path, wanted: &[usize]) -> Result<Vec<(usize, Frame)>, DecodeError> {
            let mut selector = FrameSelector::new(wanted);
            Ok((0..3)
                .filter(|&i| selector.select(i))
                .map(|i| (i, Frame::new(RgbImage::new(8, 8), ChannelOrder::Rgb)))
                .collect())
        }
    }

    fn detector() -> Arc<Detector> {
        let preprocessor = Preprocessor::new(4, 4, [0.5; 3], [0.5; 3], ChannelOrder::Rgb);
        Arc::new(Detector::new(
            ModelHandle::new(Arc::new(FixedClassifier("Fake", 0.93)), preprocessor.clone()),
            ModelHandle::new(Arc::new(FixedClassifier("REAL", 0.71)), preprocessor),
            Arc::new(ThreeFrames),
            FrameSampler::new(4),
            Granularity::Clip,
        ))
    }

    fn router_with_llm(llm: LlmConfig) -> Router {
        let metrics = Arc::new(Metrics::new().unwrap());
        let explainer = Explainer::new(ChatClient::new(&llm).unwrap(), metrics.clone());
        let state = SharedState {
            detector: detector(),
            explainer: Arc::new(explainer),
            metrics,
        };
        build_router(state, 1024 * 1024)
    }

    fn router() -> Router {
        router_with_llm(LlmConfig::default())
    }

    fn llm_at(server: &MockServer) -> LlmConfig {
        LlmConfig {
            api_url: format!("{}/v1/chat/completions", server.uri()),
            api_key: Some("test-key".to_string()),
            ..LlmConfig::default()
        }
    }

    fn png_bytes() -> Vec<u8> {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(16, 16, Rgb([10, 200, 10]));
        let mut image_data: Vec<u8> = Vec::new();
        img.write_to(&mut Cursor::new(&mut image_data), image::ImageFormat::Png)
            .unwrap();
        image_data
    }

    struct Part<'a> {
        name: &'a str,
        file: Option<(&'a str, &'a str)>,
        data: &'a [u8],
    }

    fn file_part<'a>(filename: &'a str, content_type: &'a str, data: &'a [u8]) -> Part<'a> {
        Part {
            name: "file",
            file: Some((filename, content_type)),
            data,
        }
    }

    fn multipart_request(uri: &str, parts: &[Part<'_>]) -> Request<Body> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
            match part.file {
                Some((filename, content_type)) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                        part.name, filename, content_type
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", part.name).as_bytes(),
                ),
            }
            body.extend_from_slice(part.data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

        Request::post(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn test_healthcheck() {
        let request = Request::get("/health").body(Body::empty()).unwrap();

        let (status, body) = send(router(), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "Available" }));
    }

    #[tokio::test]
    async fn test_detect_image() {
        let png = png_bytes();
        let request = multipart_request("/api/detect", &[file_part("face.png", "image/png", &png)]);

        let (status, body) = send(router(), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "image");
        assert_eq!(body["label"], "Fake");
        assert!((body["confidence"].as_f64().unwrap() - 0.93).abs() < 1e-6);
        assert_eq!(body["artifacts"][0]["type"], "face_texture");
        assert_eq!(body["predictions"].as_array().unwrap().len(), 1);
        assert!(body.get("explanation").is_none());
    }

    #[tokio::test]
    async fn test_detect_video() {
        let request = multipart_request(
            "/api/detect",
            &[file_part("clip.mp4", "video/mp4", b"not really an mp4")],
        );

        let (status, body) = send(router(), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["type"], "video");
        assert_eq!(body["label"], "REAL");
        assert_eq!(body["artifacts"][0]["type"], "frame_consistency");
    }

    #[tokio::test]
    async fn test_agent_detect_falls_back_when_service_fails() {
        let server = MockServer::start().await;
        Mock::given(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        let png = png_bytes();
        let request = multipart_request("/api/agent-detect", &[file_part("face.png", "image/png", &png)]);

        let (status, body) = send(router_with_llm(llm_at(&server)), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["label"], "Fake");
        let confidence = body["confidence"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&confidence));
        assert_eq!(body["explanation"], Intent::Analysis.fallback());
    }

    #[tokio::test]
    async fn test_agent_detect_forwards_technical_level() {
        let server = MockServer::start().await;
        Mock::given(path("/v1/chat/completions"))
            .and(body_string_contains("User Technical Level: expert"))
            .and(body_string_contains("face.png"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "Detailed forensic report." } }]
            })))
            .expect(1)
            .mount(&server)
            .await;
        let png = png_bytes();
        let request = multipart_request(
            "/api/agent-detect",
            &[
                Part {
                    name: "technical_level",
                    file: None,
                    data: b"Expert",
                },
                file_part("face.png", "image/png", &png),
            ],
        );

        let (status, body) = send(router_with_llm(llm_at(&server)), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["explanation"], "Detailed forensic report.");
    }

    #[tokio::test]
    async fn test_rejects_unsupported_type() {
        let request = multipart_request(
            "/api/detect",
            &[file_part("notes.txt", "text/plain", b"hello")],
        );

        let (status, body) = send(router(), request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "Unsupported file type" }));
    }

    #[tokio::test]
    async fn test_rejects_missing_file() {
        let request = multipart_request(
            "/api/agent-detect",
            &[Part {
                name: "technical_level",
                file: None,
                data: b"basic",
            }],
        );

        let (status, body) = send(router(), request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "No file uploaded" }));

        let not_multipart = Request::post("/api/detect")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = send(router(), not_multipart).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "No file uploaded" }));
    }

    #[tokio::test]
    async fn test_undecodable_image_is_server_error() {
        let request = multipart_request(
            "/api/detect",
            &[file_part("broken.png", "image/png", b"\x89PNG truncated")],
        );

        let (status, body) = send(router(), request).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().starts_with("Decode failed"));
    }

    #[tokio::test]
    async fn test_chat_always_answers() {
        let request = Request::post("/api/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({
                    "message": "Are deepfakes dangerous?",
                    "intent": "threat_analysis",
                    "context": [{ "role": "user", "content": "hi" }]
                })
                .to_string(),
            ))
            .unwrap();

        let (status, body) = send(router(), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"], Intent::ThreatAnalysis.fallback());
    }

    #[tokio::test]
    async fn test_chat_uses_service_reply() {
        let server = MockServer::start().await;
        Mock::given(path("/v1/chat/completions"))
            .and(body_string_contains("What is a GAN?"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": "A generative adversarial network." } }]
            })))
            .mount(&server)
            .await;
        let request = Request::post("/api/chat")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "message": "What is a GAN?" }).to_string()))
            .unwrap();

        let (status, body) = send(router_with_llm(llm_at(&server)), request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"], "A generative adversarial network.");
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let router = router();
        let png = png_bytes();
        let request = multipart_request("/api/detect", &[file_part("face.png", "image/png", &png)]);
        let (status, _) = send(router.clone(), request).await;
        assert_eq!(status, StatusCode::OK);

        let response = router
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(
            to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap()
                .to_vec(),
        )
        .unwrap();

        assert!(text.contains("requests_total"));
        assert!(text.contains("detections_total"));
    }
}
