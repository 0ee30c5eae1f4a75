//! HTTP stats endpoint.
//!
//! Serves the published statistics snapshot as JSON. Any `GET`, whatever
//! the path, returns the current snapshot; everything else is a 405. The
//! response headers mirror the historical daemon so existing scrapers
//! keep working.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::snapshot::SnapshotPublisher;

const SERVER_NAME: &str = "vban2pipe";

/// Build the router: one catch-all handler over the shared publisher.
pub fn build_router(publisher: Arc<SnapshotPublisher>) -> Router {
    Router::new().fallback(stats).with_state(publisher)
}

/// Any `GET` dumps the published snapshot; other methods get a 405.
async fn stats(State(publisher): State<Arc<SnapshotPublisher>>, method: Method) -> Response {
    if method != Method::GET {
        return (
            StatusCode::METHOD_NOT_ALLOWED,
            [
                (header::SERVER, SERVER_NAME),
                (header::CONNECTION, "close"),
            ],
        )
            .into_response();
    }

    let snapshot = publisher.read();
    let body = serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".into());

    (
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::SERVER, SERVER_NAME),
            (header::CONNECTION, "close"),
        ],
        body,
    )
        .into_response()
}

/// Start the stats server. Returns the `JoinHandle` so the caller can
/// join on it alongside the ingest engine; a server error terminates this
/// task only.
pub async fn start(
    port: u16,
    publisher: Arc<SnapshotPublisher>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    let app = build_router(publisher);

    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "🌐 stats endpoint listening");

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "stats endpoint stopped");
        }
    });

    Ok(handle)
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{Role, StreamSnapshot};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn publisher_with_streams() -> Arc<SnapshotPublisher> {
        let publisher = Arc::new(SnapshotPublisher::new());
        publisher.publish(
            11,
            vec![StreamSnapshot {
                name: "mic".into(),
                role: Role::Primary,
                ifname: "eth0".into(),
                peer: "10.0.0.1:6980".into(),
                format: "s16le",
                rate: 48000,
                channels: 2,
                expected: 1234,
                lost: 3,
                ignored: false,
                synchronized: true,
                offset: 0,
                average_us: 5333.0,
                stddev_us: 10.0,
                uptime: 42,
            }],
        );
        publisher
    }

    #[tokio::test]
    async fn test_get_returns_json_snapshot() {
        let app = build_router(publisher_with_streams());
        let resp = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        assert_eq!(resp.headers()[header::SERVER], "vban2pipe");

        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["lost"], 11);
        assert_eq!(json["streams"][0]["role"], "primary");
        assert_eq!(json["streams"][0]["synchonized"], true);
        assert_eq!(json["streams"][0]["expected"], 1234);
    }

    #[tokio::test]
    async fn test_get_any_path_works() {
        let app = build_router(publisher_with_streams());
        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/some/where?else")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_post_is_method_not_allowed() {
        let app = build_router(publisher_with_streams());
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.is_empty());
    }

    #[tokio::test]
    async fn test_empty_snapshot_after_clear() {
        let publisher = publisher_with_streams();
        publisher.clear();
        let app = build_router(publisher);
        let resp = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["lost"], 0);
        assert_eq!(json["streams"].as_array().unwrap().len(), 0);
    }
}
