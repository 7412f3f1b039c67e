// NIP-11 リレー情報ドキュメント
//
// リクエストごとにテナントの情報設定と制限値から組み立てる。
// ホストごとに自身の制限値を公開する

use axum::body::Body;
use axum::http::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE,
};
use axum::http::StatusCode;
use axum::response::Response;
use tracing::error;

use crate::domain::RelayInfoDocument;
use crate::infrastructure::Tenant;

pub const NOSTR_JSON: &str = "application/nostr+json";

pub struct Nip11Handler<'a> {
    tenant: &'a Tenant,
}

impl<'a> Nip11Handler<'a> {
    pub fn new(tenant: &'a Tenant) -> Self {
        Self { tenant }
    }

    pub fn build_relay_info(&self) -> RelayInfoDocument {
        self.tenant.info.document(&self.tenant.limitation)
    }

    /// `Accept: application/nostr+json` 付きの `GET /`
    pub fn handle(&self) -> Response {
        let (status, body) = match serde_json::to_string(&self.build_relay_info()) {
            Ok(json) => (StatusCode::OK, Body::from(json)),
            Err(err) => {
                error!(tenant = %self.tenant.id, error = %err, "failed to serialize relay info");
                (StatusCode::INTERNAL_SERVER_ERROR, Body::empty())
            }
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = Self::build_cors_headers();
        response
    }

    /// `OPTIONS /` へのプリフライト応答
    pub fn handle_options() -> Response {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        let mut headers = Self::build_cors_headers();
        headers.remove(CONTENT_TYPE);
        *response.headers_mut() = headers;
        response
    }

    /// Content-Type と NIP-11 が求めるCORSヘッダー
    pub fn build_cors_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(NOSTR_JSON));
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("Accept"));
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, HeaderValue::from_static("GET, OPTIONS"));
        headers
    }
}

/// `Accept` ヘッダーが情報ドキュメントを要求していれば true
pub fn wants_relay_info(headers: &HeaderMap) -> bool {
    headers
        .get_all(axum::http::header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.contains(NOSTR_JSON))
}
