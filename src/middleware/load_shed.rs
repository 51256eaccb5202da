//! Admission middleware
//!
//! Admits the request through the `LoadShedder` before it reaches routing and
//! rejects it with 503 + `Retry-After` when overloaded. The admission token is
//! placed in the request extensions (the handler hands a clone to the
//! streaming relay as its "finish" signal) and bound to the response body: the
//! body being dropped, on completion or client disconnect, is the "close"
//! signal. Whichever fires first releases; the other is a no-op.

use crate::error::AppError;
use crate::shedder::{AdmissionToken, LoadShedder};
use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use futures::StreamExt;
use std::sync::Arc;

pub async fn load_shed_middleware(
    State(shedder): State<Arc<LoadShedder>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = shedder.admit()?;
    request.extensions_mut().insert(token.clone());

    let response = next.run(request).await;
    Ok(release_on_close(response, token))
}

/// Releases its token when the response body is dropped
struct CloseSignal(AdmissionToken);

impl Drop for CloseSignal {
    fn drop(&mut self) {
        if self.0.release() {
            tracing::trace!(token_id = %self.0.id(), "Admission released on body close");
        }
    }
}

fn release_on_close(response: Response, token: AdmissionToken) -> Response {
    let (parts, body) = response.into_parts();
    let signal = CloseSignal(token);
    let body = body.into_data_stream().map(move |chunk| {
        let _held = &signal;
        chunk
    });
    Response::from_parts(parts, Body::from_stream(body))
}
