//! The request gate: the per-request decision between proxying and login.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tower_cookies::Cookies;
use tracing::{error, info};

use crate::error::HttpError;
use crate::routes::found;
use crate::ServerState;

/// Handle every non-callback request.
///
/// A request with an authenticated session is forwarded to the backend
/// unmodified; anything else has its URL stashed in the session and is
/// redirected to the provider's authorization endpoint. The two outcomes are
/// mutually exclusive by construction.
#[axum::debug_handler(state = ServerState)]
pub async fn gate_handler(
    State(state): State<ServerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    cookies: Cookies,
    req: Request,
) -> Result<Response, HttpError> {
    if !req
        .uri()
        .path()
        .starts_with(state.config.server.protect_path.as_str())
    {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    let mut session = state.sessions.load(&cookies);
    match session.user().map(String::from) {
        Some(user) => {
            info!(%user, url = %req.uri(), "forwarding authenticated request");

            state.forwarder.forward(peer.ip(), req).await.map_err(|e| {
                error!("error forwarding request to backend: {e}");
                HttpError::BadGateway("backend unavailable")
            })
        }
        None => {
            // Stash the destination before redirecting so the callback can
            // send the user back where they were headed.
            session.next = Some(req.uri().to_string());
            state.sessions.save(&cookies, &session).map_err(|e| {
                error!("failed to persist session: {e}");
                HttpError::Internal("failed to persist session")
            })?;

            info!(url = %req.uri(), "unauthenticated request, asking for login");

            found(&state.provider.authorize_url())
        }
    }
}
