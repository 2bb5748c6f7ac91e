//! HSM Service REST API Handlers

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::Engine;
use custody::{
    CreateKeyParams, CustodyError, KeyInfo, KeyService, KeySummary, Module, SessionManager,
    SignResult, Signer,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

/// Shared handler state
pub struct AppState<M: Module> {
    pub keys: KeyService<M>,
    pub signer: Signer<M>,
}

impl<M: Module> AppState<M> {
    pub fn new(sessions: Arc<SessionManager<M>>) -> Self {
        Self {
            keys: KeyService::new(sessions.clone()),
            signer: Signer::new(sessions),
        }
    }
}

impl<M: Module> Clone for AppState<M> {
    fn clone(&self) -> Self {
        Self {
            keys: self.keys.clone(),
            signer: self.signer.clone(),
        }
    }
}

/// How the `data` field of a sign request is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataEncoding {
    #[default]
    Utf8,
    Base64,
}

/// Request to sign data
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    /// Hex key identifier
    pub id: String,
    pub data: String,
    #[serde(default)]
    pub encoding: DataEncoding,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
}

// ==================== Error Handling ====================

pub struct ApiError(pub StatusCode, pub Json<ErrorResponse>);

impl ApiError {
    fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        ApiError(status, Json(ErrorResponse { error: msg.into() }))
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }
}

impl From<CustodyError> for ApiError {
    fn from(e: CustodyError) -> Self {
        match &e {
            CustodyError::KeyNotFound(_) => ApiError::not_found(e.to_string()),
            CustodyError::Unauthorized(_) => ApiError::unauthorized(e.to_string()),
            CustodyError::InvalidRequest(_) => ApiError::bad_request(e.to_string()),
            _ => {
                error!(error = %e, "Custody operation failed");
                ApiError::internal(e.to_string())
            }
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

/// Run a token operation on the blocking pool.
async fn blocking<T, F>(operation: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CustodyError> + Send + 'static,
{
    tokio::task::spawn_blocking(operation)
        .await
        .map_err(|e| ApiError::internal(format!("Token task failed: {}", e)))?
        .map_err(ApiError::from)
}

// ==================== Handlers ====================

/// Health check
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// Generate a new P-256 key pair
pub async fn create_key<M: Module>(
    State(state): State<AppState<M>>,
    payload: Result<Json<CreateKeyParams>, JsonRejection>,
) -> Result<(StatusCode, Json<KeyInfo>), ApiError> {
    let Json(params) = payload?;
    let keys = state.keys.clone();
    let info = blocking(move || keys.create_key_pair(params)).await?;
    Ok((StatusCode::CREATED, Json(info)))
}

/// List public keys on the token
pub async fn list_keys<M: Module>(
    State(state): State<AppState<M>>,
) -> Result<Json<Vec<KeySummary>>, ApiError> {
    let keys = state.keys.clone();
    let listing = blocking(move || keys.list_keys()).await?;
    Ok(Json(listing.keys))
}

pub async fn get_key<M: Module>(
    State(state): State<AppState<M>>,
    Path(id): Path<String>,
) -> Result<Json<KeyInfo>, ApiError> {
    let keys = state.keys.clone();
    let info = blocking(move || keys.get_key_by_id(&id)).await?;
    Ok(Json(info))
}

pub async fn delete_key<M: Module>(
    State(state): State<AppState<M>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let keys = state.keys.clone();
    blocking(move || keys.delete_key_by_id(&id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Sign data with a key
pub async fn sign<M: Module>(
    State(state): State<AppState<M>>,
    payload: Result<Json<SignRequest>, JsonRejection>,
) -> Result<Json<SignResult>, ApiError> {
    let Json(request) = payload?;
    if request.data.is_empty() {
        return Err(ApiError::bad_request("Data cannot be empty"));
    }

    let data = match request.encoding {
        DataEncoding::Utf8 => request.data.into_bytes(),
        DataEncoding::Base64 => base64::engine::general_purpose::STANDARD
            .decode(&request.data)
            .map_err(|e| ApiError::bad_request(format!("Invalid base64 data: {}", e)))?,
    };

    let signer = state.signer.clone();
    let id = request.id;
    let result = blocking(move || signer.sign_data(&id, &data)).await?;
    Ok(Json(result))
}
