use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tokio::net::TcpListener;

/// Liveness and readiness routes.
///
/// `/health` always answers `ok`. `/ready` consults `is_ready` on every call and
/// answers 503 until it returns true.
pub fn router<F>(is_ready: F) -> Router
where
    F: Fn() -> bool + Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/health", get(|| async { "ok\n" }))
        .route(
            "/ready",
            get(move || {
                let ready = is_ready();
                async move {
                    if ready {
                        (StatusCode::OK, "ok\n")
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, "not ready\n")
                    }
                }
            }),
        )
}

pub async fn serve(host: &str, port: u16, app: Router) -> std::io::Result<()> {
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!(%host, port, "listening");
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http::Request;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tower::ServiceExt;

    async fn status_of(app: Router, path: &str) -> StatusCode {
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        app.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn test_readiness_follows_flag() {
        let ready = Arc::new(AtomicBool::new(false));
        let flag = ready.clone();
        let app = router(move || flag.load(Ordering::Relaxed));

        assert_eq!(status_of(app.clone(), "/health").await, StatusCode::OK);
        assert_eq!(
            status_of(app.clone(), "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        ready.store(true, Ordering::Relaxed);
        assert_eq!(status_of(app.clone(), "/ready").await, StatusCode::OK);
        assert_eq!(status_of(app, "/missing").await, StatusCode::NOT_FOUND);
    }
}
