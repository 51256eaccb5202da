//! OpenAI-compatible chat completions endpoint (`/v1/chat/completions`)
//!
//! Same gateway semantics as `/v1/messages`: the body is forwarded to
//! whichever backend the router picks, translated only by model override.

use axum::{extract::Request, extract::State, response::Response};

use crate::error::AppError;
use crate::handlers::AppState;
use crate::handlers::proxy::{self, ClientApi};

pub async fn handler(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, AppError> {
    proxy::forward(state, ClientApi::ChatCompletions, request).await
}
