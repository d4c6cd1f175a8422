//! Bearer-token validation
//!
//! Token issuance, registration and login live in an external
//! collaborator; this module only validates the HS256 bearer token and
//! injects the caller's identity into request extensions as
//! [`AuthenticatedUser`].

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::core_types::UserId;
use crate::gateway::state::AppState;
use crate::gateway::types::{ApiResponse, error_codes};

/// Role string carried by admin tokens.
pub const ROLE_ADMIN: &str = "admin";

/// Identity injected into request extensions after validation.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
    pub role: String,
}

impl AuthenticatedUser {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_ADMIN
    }
}

/// Claims shape shared with the external issuer.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id.
    pub sub: String,
    #[serde(default)]
    pub role: String,
    pub exp: usize,
}

/// HS256 verifier.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Validate the token and extract the caller identity.
    pub fn verify(&self, token: &str) -> Result<AuthenticatedUser, jsonwebtoken::errors::Error> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        let user_id: UserId = data.claims.sub.parse().map_err(|_| {
            jsonwebtoken::errors::Error::from(jsonwebtoken::errors::ErrorKind::InvalidSubject)
        })?;
        Ok(AuthenticatedUser {
            user_id,
            role: data.claims.role,
        })
    }
}

type AuthRejection = (StatusCode, Json<ApiResponse<()>>);

fn unauthorized(code: i32, msg: &str) -> AuthRejection {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiResponse::<()>::error(code, msg)),
    )
}

fn extract_bearer(request: &Request<Body>) -> Result<&str, AuthRejection> {
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            unauthorized(error_codes::MISSING_AUTH, "Missing Authorization header")
        })?;

    auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(|| unauthorized(error_codes::AUTH_FAILED, "Invalid token format"))
}

/// Require a valid bearer token; injects [`AuthenticatedUser`].
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AuthRejection> {
    let token = extract_bearer(&request)?;

    match state.verifier.verify(token) {
        Ok(user) => {
            request.extensions_mut().insert(user);
            Ok(next.run(request).await)
        }
        Err(_) => Err(unauthorized(
            error_codes::AUTH_FAILED,
            "Invalid or expired token",
        )),
    }
}

/// Require a valid bearer token with the admin role.
pub async fn admin_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AuthRejection> {
    let token = extract_bearer(&request)?;

    let user = state.verifier.verify(token).map_err(|_| {
        unauthorized(error_codes::AUTH_FAILED, "Invalid or expired token")
    })?;

    if !user.is_admin() {
        return Err((
            StatusCode::FORBIDDEN,
            Json(ApiResponse::<()>::error(
                error_codes::FORBIDDEN,
                "Admin role required",
            )),
        ));
    }

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}
