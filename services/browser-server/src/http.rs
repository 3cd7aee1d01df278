//! The one route this service exposes (spec.md §6): `POST
//! /api/data/{priority}`. Body in, body out, both the packet codec;
//! `Content-Type: application/cbor` on success.
//!
//! Router shape (one `Router::new().route(...).with_state(state)`,
//! `impl IntoResponse` handlers returning `(StatusCode, ...)` tuples on
//! the error path) follows `iwismer-rusty-timer/services/server`'s
//! `build_router`/`http::export::export_raw`.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;

use browser_core::engine::PacketEngine;
use browser_protocol::InboundPacket;

pub fn build_router(engine: Arc<PacketEngine>) -> Router {
    Router::new()
        .route("/api/data/:priority", post(handle_data))
        .route("/healthz", axum::routing::get(healthz))
        .with_state(engine)
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

/// Decodes the inbound packet, runs it through the engine, and encodes
/// the outbound packet back. Only a packet-shell decode failure becomes
/// an HTTP error response; anything wrong inside a sub-request is
/// encoded as a per-id error reply by the engine itself (spec.md §7).
async fn handle_data(State(engine): State<Arc<PacketEngine>>, Path(priority): Path<String>, body: Bytes) -> Response {
    let priority = match priority.as_str() {
        "hi" | "lo" => priority,
        _ => return (StatusCode::NOT_FOUND, "unknown priority, expected hi or lo").into_response(),
    };

    let packet = match InboundPacket::decode(&body) {
        Ok(packet) => packet,
        Err(err) => return (StatusCode::BAD_REQUEST, err.to_string()).into_response(),
    };

    let outbound = engine.process(packet, &priority).await;
    let bytes = outbound.encode();

    ([(header::CONTENT_TYPE, "application/cbor")], bytes).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_engine() -> Arc<PacketEngine> {
        let settings: crate::config::Settings = toml::from_str("supported_versions = [14]").unwrap();
        Arc::new(crate::app::build_engine(&settings))
    }

    #[tokio::test]
    async fn rejects_unknown_priority_segment() {
        let router = build_router(test_engine());
        let response = router
            .oneshot(Request::builder().method("POST").uri("/api/data/medium").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rejects_malformed_packet_body_with_bad_request() {
        let router = build_router(test_engine());
        let response = router
            .oneshot(Request::builder().method("POST").uri("/api/data/hi").body(Body::from(vec![0xffu8])).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn accepts_a_well_formed_boot_packet() {
        let router = build_router(test_engine());
        let packet = InboundPacket {
            channel: browser_protocol::Channel { scheme: 0, value: "t".into() },
            version: browser_protocol::Version { egs: 14, extra: vec![] },
            requests: vec![browser_protocol::SubRequest {
                id: 1,
                kind: browser_protocol::RequestKind::Boot,
                payload: ciborium::value::Value::Null,
            }],
        };
        let response = router
            .oneshot(Request::builder().method("POST").uri("/api/data/hi").body(Body::from(packet.encode())).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/cbor"
        );
    }
}
