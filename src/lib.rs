//! # doorman
//!
//! doorman is an authenticating reverse proxy for a single backend origin.
//!
//! ## About
//!
//! Every inbound request must present a session cookie proving a completed
//! login with the configured OAuth provider. Requests that do are forwarded
//! to the backend untouched; requests that don't are redirected to the
//! provider's authorization endpoint and come back through the callback
//! handler, which exchanges the authorization code, matches the resulting
//! identity against a configured pattern, and marks the session
//! authenticated.
//!
//! All session state rides inside an encrypted cookie — the server keeps no
//! session table. The cookie key is generated at startup, so restarting the
//! proxy logs every browser out.

pub mod authz;
pub mod config;
pub mod error;
pub mod provider;
pub mod proxy;
mod routes;
pub mod session;
pub mod shutdown;

pub use routes::routes;

use anyhow::Context;

use authz::EmailMatcher;
use config::Config;
use provider::ProviderClient;
use proxy::Forwarder;
use session::{SessionKey, SessionStore};

/// Shared state handed to every request handler.
#[derive(Clone, Debug)]
pub struct ServerState {
    pub config: Config,
    pub sessions: SessionStore,
    pub authz: EmailMatcher,
    pub provider: ProviderClient,
    pub forwarder: Forwarder,
}

impl ServerState {
    /// Wire the request-handling components up from a validated
    /// configuration, generating the process-lifetime cookie key.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let key = SessionKey::generate().context("failed to generate cookie key")?;
        let sessions = SessionStore::new(config.server.cookie_name.clone(), key);
        let authz =
            EmailMatcher::new(&config.oauth.email_pattern).context("invalid email pattern")?;
        let provider =
            ProviderClient::new(&config.oauth).context("invalid provider configuration")?;
        let forwarder =
            Forwarder::new(&config.server.backend_url).context("invalid backend origin")?;

        Ok(Self {
            config,
            sessions,
            authz,
            provider,
            forwarder,
        })
    }
}
