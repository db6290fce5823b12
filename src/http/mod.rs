//! HTTP surface: the raw kernel/session REST+WS API and the notebook-as-API
//! dispatcher, plus the auth/CORS middleware shared by both (C4/C8/C9
//! wired into axum routes).

pub mod notebook_http;
pub mod raw;
pub mod swagger;

use axum::extract::{Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::config::Settings;
use crate::error::GatewayError;

#[derive(Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

/// Bearer-token auth: header `Authorization: token <t>` or query
/// `?token=<t>`. `OPTIONS` requests are always allowed through for CORS
/// preflight.
pub async fn require_auth(
    State(settings): State<std::sync::Arc<Settings>>,
    Query(query): Query<TokenQuery>,
    request: Request,
    next: Next,
) -> Response {
    if !settings.auth_required() || request.method() == axum::http::Method::OPTIONS {
        return next.run(request).await;
    }

    let header_token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("token "));

    let supplied = header_token.or(query.token.as_deref());

    match supplied {
        None => GatewayError::AuthMissing.into_response(),
        Some(token) if token == settings.auth_token => next.run(request).await,
        Some(_) => GatewayError::AuthInvalid.into_response(),
    }
}

/// Build the CORS layer from the configured `KG_ALLOW_*`/`KG_EXPOSE_HEADERS`/
/// `KG_MAX_AGE` settings. Empty strings leave the corresponding header unset
/// (methods/headers fall back to allowing any, matching the permissive
/// defaults a locally-hosted gateway expects).
pub fn cors_layer(settings: &Settings) -> tower_http::cors::CorsLayer {
    use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders};

    let mut layer = CorsLayer::new();

    layer = if settings.allow_origin.is_empty() {
        layer
    } else {
        layer.allow_origin(AllowOrigin::exact(
            settings.allow_origin.parse().expect("configured origin is a valid header value"),
        ))
    };

    if !settings.allow_credentials.is_empty() {
        layer = layer.allow_credentials(settings.allow_credentials == "true");
    }

    layer = if settings.allow_methods.is_empty() {
        layer.allow_methods(AllowMethods::any())
    } else {
        layer.allow_methods(AllowMethods::list(parse_methods(&settings.allow_methods)))
    };

    layer = if settings.allow_headers.is_empty() {
        layer.allow_headers(AllowHeaders::any())
    } else {
        layer.allow_headers(AllowHeaders::list(parse_header_names(&settings.allow_headers)))
    };

    if !settings.expose_headers.is_empty() {
        layer = layer.expose_headers(ExposeHeaders::list(parse_header_names(&settings.expose_headers)));
    }

    if let Ok(seconds) = settings.max_age.parse::<u64>() {
        layer = layer.max_age(std::time::Duration::from_secs(seconds));
    }

    layer
}

fn parse_methods(raw: &str) -> Vec<axum::http::Method> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

fn parse_header_names(raw: &str) -> Vec<header::HeaderName> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse().ok())
        .collect()
}

pub async fn not_found() -> (StatusCode, &'static str) {
    (StatusCode::NOT_FOUND, "not found")
}
