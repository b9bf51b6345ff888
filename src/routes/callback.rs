//! The route completing a provider login.

use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    response::Response,
};
use tower_cookies::Cookies;
use tracing::{error, info, warn};

use crate::error::HttpError;
use crate::provider::ProviderError;
use crate::routes::found;
use crate::ServerState;

/// Handle the redirect back from the provider after the user approves the
/// login.
///
/// The authorization code from the query string is exchanged for the user's
/// identity document, the identity pattern is applied to it, and only then is
/// the session touched: a matched identity authenticates the session and
/// consumes its stored destination. Every failure leaves the session exactly
/// as it was.
#[axum::debug_handler(state = ServerState)]
pub async fn callback_handler(
    State(state): State<ServerState>,
    cookies: Cookies,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, HttpError> {
    let code = params
        .get("code")
        .ok_or(HttpError::BadRequest("missing \"code\" query parameter"))?;

    let body = state.provider.exchange(code).await.map_err(|e| match e {
        ProviderError::Exchange(_) => {
            error!("authorization code exchange failed: {e}");
            HttpError::BadRequest("authorization code was rejected")
        }
        ProviderError::UserInfo(_) => {
            error!("user info fetch failed: {e}");
            HttpError::BadGateway("could not fetch user info from provider")
        }
        ProviderError::Endpoint { .. } | ProviderError::Client(_) => {
            error!("provider client failure: {e}");
            HttpError::Internal("provider client failure")
        }
    })?;

    let Some(user) = state.authz.identify(&body) else {
        warn!("access denied: nothing in the provider response matched the email pattern");
        return Err(HttpError::Forbidden("access denied"));
    };

    let mut session = state.sessions.load(&cookies);
    session.authenticated = true;
    session.email = Some(user.clone());
    let next = session
        .next
        .take()
        .unwrap_or_else(|| state.config.server.protect_path.clone());

    state.sessions.save(&cookies, &session).map_err(|e| {
        error!("failed to persist session: {e}");
        HttpError::Internal("failed to persist session")
    })?;

    info!(%user, "user logged in");

    found(&next)
}
