//! Shortcuts for driving `GatewayService` in process.

use bytes::Bytes;
use capgate::config::GatewayConfig;
use capgate::gateway_service::{GatewayBody, GatewayService};
use http::{Request, Response};
use http_body_util::{BodyExt, Full};

/// Gateway pointed at `backend_url` with default routes.
pub fn gateway_for(backend_url: &str) -> GatewayService {
    gateway_with(backend_url, |_| {})
}

/// Gateway pointed at `backend_url`, with config tweaks applied first.
pub fn gateway_with(backend_url: &str, tweak: impl FnOnce(&mut GatewayConfig)) -> GatewayService {
    let mut config = GatewayConfig {
        backend_url: backend_url.to_string(),
        ..GatewayConfig::default()
    };
    tweak(&mut config);
    config.validate().expect("test config must be valid");
    GatewayService::new(&config).expect("Failed to create gateway")
}

/// A typical client POST: JSON body, bearer token, a stray custom header.
pub fn client_post(path: &str, body: impl Into<Bytes>) -> Request<Full<Bytes>> {
    Request::post(path)
        .header("content-type", "application/json")
        .header("accept", "application/json")
        .header("authorization", "Bearer sk-client-secret")
        .header("x-client-trace", "trace-1")
        .body(Full::new(body.into()))
        .unwrap()
}

/// Collect a response body as UTF-8.
pub async fn body_string(response: Response<GatewayBody>) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("response body failed")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("response body is not UTF-8")
}

/// Collect every data frame of a response body separately.
pub async fn body_frames(response: Response<GatewayBody>) -> Vec<String> {
    let mut body = response.into_body();
    let mut frames = Vec::new();
    while let Some(frame) = body.frame().await {
        let frame = frame.expect("response body failed");
        if let Ok(data) = frame.into_data() {
            frames.push(String::from_utf8(data.to_vec()).expect("frame is not UTF-8"));
        }
    }
    frames
}
