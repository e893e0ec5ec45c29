//! Rejects oversized request bodies before they reach a handler, by
//! `Content-Length` header inspection only (no body buffering).

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tower::{Layer, Service};

#[derive(Clone)]
pub struct PayloadLimitLayer {
    max_size: u64,
}

impl PayloadLimitLayer {
    pub fn with_limit(max_size: u64) -> Self {
        Self { max_size }
    }
}

impl<S> Layer<S> for PayloadLimitLayer {
    type Service = PayloadLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        PayloadLimitService {
            inner,
            max_size: self.max_size,
        }
    }
}

#[derive(Clone)]
pub struct PayloadLimitService<S> {
    inner: S,
    max_size: u64,
}

impl<S> Service<Request<Body>> for PayloadLimitService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = std::pin::Pin<Box<dyn std::future::Future<Output = Result<Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let max_size = self.max_size;
        let content_length = request
            .headers()
            .get(axum::http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        if let Some(received) = content_length {
            if received > max_size {
                let body = json!({
                    "error": "payload too large",
                    "max_size_bytes": max_size,
                    "received_bytes": received,
                });
                let response = (StatusCode::PAYLOAD_TOO_LARGE, axum::Json(body)).into_response();
                return Box::pin(async move { Ok(response) });
            }
        }

        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(request).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use axum::routing::post;
    use axum::Router;
    use tower::ServiceExt;

    async fn echo() -> &'static str {
        "ok"
    }

    fn app(limit: u64) -> Router {
        Router::new()
            .route("/", post(echo))
            .layer(PayloadLimitLayer::with_limit(limit))
    }

    #[tokio::test]
    async fn allows_payload_within_limit() {
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header(axum::http::header::CONTENT_LENGTH, "10")
            .body(Body::from("0123456789"))
            .unwrap();
        let response = app(100).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rejects_payload_over_limit() {
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .header(axum::http::header::CONTENT_LENGTH, "1000")
            .body(Body::from(vec![0u8; 1000]))
            .unwrap();
        let response = app(100).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn allows_request_with_no_content_length_header() {
        let request = Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::empty())
            .unwrap();
        let response = app(100).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
