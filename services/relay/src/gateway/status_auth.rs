//! `/status` のBearerトークン確認
//!
//! `Authorization: Bearer <token>` またはトークンそのものを受け付ける。
//! トークン未設定なら認証なしで公開する。

use axum::{
    body::Body,
    extract::State,
    http::{header::AUTHORIZATION, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::error::ApiError;

#[derive(Clone, Default)]
pub struct StatusAuth {
    pub token: Option<String>,
}

impl StatusAuth {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.trim().is_empty()),
        }
    }
}

pub async fn status_auth_middleware(
    State(auth): State<StatusAuth>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(expected) = auth.token.as_deref() else {
        return next.run(request).await;
    };

    let authorized = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .map(|header| header.strip_prefix("Bearer ").unwrap_or(header).trim() == expected);

    match authorized {
        Some(true) => next.run(request).await,
        Some(false) => {
            tracing::warn!(path = %request.uri().path(), "invalid status token");
            ApiError::unauthorized("invalid token").into_response()
        }
        None => {
            tracing::warn!(path = %request.uri().path(), "missing Authorization header");
            ApiError::unauthorized("Authorization header required").into_response()
        }
    }
}
