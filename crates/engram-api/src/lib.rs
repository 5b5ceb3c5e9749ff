// NOTE: Surface Rationale
//
// Why one envelope for every response?
// - Clients never branch on HTTP status alone; the stable `code` field is
//   the contract and 5xx stays reserved for genuinely unexpected failures
//
// Why rate limiting per remote address with a loopback allowance?
// - The dashboard polls aggressively and runs on the same host; remote
//   callers are the ones a runaway script can arrive from

mod error;
mod ratelimit;
mod routes;
mod server;
mod ws;

pub use error::ApiError;
pub use ratelimit::RateLimiter;
pub use server::{AppState, router, serve};

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn error_envelope_carries_stable_codes() {
        let response = ApiError::NotFound("node".to_string()).into_response();
        assert_eq!(response.status(), 404);
        let json = body_json(response).await;
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn rate_limit_error_includes_retry_after() {
        let response = ApiError::RateLimited {
            retry_after_seconds: 7,
        }
        .into_response();
        assert_eq!(response.status(), 429);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "RATE_LIMITED");
        assert_eq!(json["error"]["details"]["retryAfter"], 7);
    }

    #[tokio::test]
    async fn queue_full_maps_to_service_unavailable() {
        let response = ApiError::QueueFull.into_response();
        assert_eq!(response.status(), 503);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "QUEUE_FULL");
    }
}
