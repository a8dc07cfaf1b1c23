//! Bearer-token checks in front of every session and file route.

use crate::error::ApiError;
use axum::extract::{Query, Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt::Write;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

const TOKEN_BYTES: usize = 24;

pub struct TokenStore {
    credentials: Option<(String, String)>,
    tokens: RwLock<HashSet<String>>,
}

impl TokenStore {
    /// `credentials` enables `login`; `static_tokens` are valid from the start.
    pub fn new<I>(credentials: Option<(String, String)>, static_tokens: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            credentials,
            tokens: RwLock::new(
                static_tokens
                    .into_iter()
                    .filter(|t| !t.is_empty())
                    .collect(),
            ),
        }
    }

    /// Issues a fresh token when the pair matches the configured credentials.
    pub fn login(&self, username: &str, password: &str) -> Option<String> {
        let (expected_user, expected_password) = self.credentials.as_ref()?;
        if username != expected_user || password != expected_password {
            debug!(username, "rejected login");
            return None;
        }
        let token = random_token();
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.insert(token.clone());
        }
        info!(username, "issued token");
        Some(token)
    }

    pub fn is_valid(&self, token: &str) -> bool {
        self.tokens
            .read()
            .map(|tokens| tokens.contains(token))
            .unwrap_or(false)
    }
}

fn random_token() -> String {
    let bytes: [u8; TOKEN_BYTES] = rand::random();
    bytes.iter().fold(String::with_capacity(TOKEN_BYTES * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Takes the token from `Authorization: Bearer …` or, for media players that
/// cannot set headers, from the `token` query parameter.
fn request_token(request: &Request) -> Option<String> {
    let from_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split_whitespace().nth(1))
        .map(str::to_string);
    from_header.or_else(|| {
        Query::<TokenQuery>::try_from_uri(request.uri())
            .ok()
            .and_then(|Query(q)| q.token)
    })
}

pub async fn require_auth(
    State(tokens): State<Arc<TokenStore>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    match request_token(&request) {
        Some(token) if tokens.is_valid(&token) => Ok(next.run(request).await),
        _ => Err(ApiError::Unauthorized),
    }
}
