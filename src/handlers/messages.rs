//! Anthropic Messages API endpoint (`/v1/messages`)

use axum::{extract::Request, extract::State, response::Response};

use crate::error::AppError;
use crate::handlers::AppState;
use crate::handlers::proxy::{self, ClientApi};

pub async fn handler(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, AppError> {
    proxy::forward(state, ClientApi::Messages, request).await
}
