//! HTTP middleware

pub mod load_shed;
pub mod request_id;

pub use load_shed::load_shed_middleware;
pub use request_id::{REQUEST_ID_HEADER, RequestId, request_id_middleware};
