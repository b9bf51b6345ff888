use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Error responses produced by the request handlers.
///
/// Messages are static so nothing internal leaks to clients; the interesting
/// detail is logged at the failure site.
#[derive(Debug)]
pub enum HttpError {
    BadRequest(&'static str),
    Forbidden(&'static str),
    BadGateway(&'static str),
    Internal(&'static str),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        match self {
            HttpError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            HttpError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            HttpError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg).into_response(),
            HttpError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response(),
        }
    }
}
