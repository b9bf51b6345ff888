//! Cookie-backed sessions.
//!
//! Every piece of per-browser state lives in a single encrypted,
//! authenticated cookie; the server keeps no session table. The sealing key
//! is generated when the process starts and held only in memory, so
//! restarting the proxy logs every browser out.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use blake2::{
    digest::{
        consts::{U32, U56},
        generic_array::GenericArray,
        Mac,
    },
    Blake2bMac,
};
use chacha20::{
    cipher::{KeyIvInit, StreamCipher},
    XChaCha20,
};
use getrandom::getrandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::Duration;
use tower_cookies::{
    cookie::{Cookie, SameSite},
    Cookies,
};

const COOKIE_HEADER: &str = "v1.";

const DOMAIN_ENCRYPT: &[u8] = b"doorman-session-encryption-key";
const DOMAIN_AUTH: &[u8] = b"doorman-session-auth-key";

/// How long a browser keeps the session cookie around.
const COOKIE_MAX_AGE_DAYS: i64 = 30;

/// Errors while sealing or opening a session cookie.
#[derive(Error, Clone, Debug)]
pub enum Error {
    #[error("key must be 32 bytes")]
    SizeError,
    #[error("unable to encode session as json")]
    EncodeError,
    #[error("failed to get randomness for nonce")]
    RngError,
    #[error("cookie value has invalid header")]
    InvalidHeader,
    #[error("unable to decode cookie value")]
    InvalidMessage,
    #[error("failed to authenticate cookie value")]
    AuthFailure,
    #[error("unable to decode session as json")]
    DecodeError,
}

/// The authentication state carried by one browser.
///
/// `email` is only meaningful while `authenticated` is set; `next` holds the
/// URL the user originally asked for while their login is in flight and is
/// consumed by the callback handler.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "auth", default)]
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<String>,
}

impl Session {
    /// The verified identity, if this session has completed a login.
    pub fn user(&self) -> Option<&str> {
        if self.authenticated {
            self.email.as_deref()
        } else {
            None
        }
    }
}

/// A key for sealing session cookies.
#[derive(Clone)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    /// Generate a fresh key. Called once at startup; both listeners share
    /// the resulting key.
    pub fn generate() -> Result<Self, Error> {
        let mut key = [0; 32];
        getrandom(&mut key).map_err(|_| Error::RngError)?;

        Ok(Self(key))
    }

    pub fn from_slice(key: &[u8]) -> Result<Self, Error> {
        Ok(Self(key.try_into().map_err(|_| Error::SizeError)?))
    }

    fn seal_message(&self, message: &[u8], nonce: &[u8]) -> String {
        // unwrapping is safe here since key size has already been checked
        let (key, n2, auth_key) = split_key(&self.0, nonce).unwrap();

        let mut c = message.to_vec();
        XChaCha20::new(&key.into(), &n2.into()).apply_keystream(&mut c);

        let mac = Blake2bMac::<U32>::new_from_slice(&auth_key)
            .unwrap()
            .chain_update(pre_auth_encode(&[COOKIE_HEADER.as_bytes(), nonce, &c]))
            .finalize()
            .into_bytes();

        let mut value = COOKIE_HEADER.to_string();
        value += &URL_SAFE_NO_PAD.encode([nonce, &c, &mac].concat());

        value
    }

    /// Seal a session into a cookie value.
    ///
    /// # Errors
    ///
    /// Fails only when the session cannot be serialized or the system RNG
    /// refuses to produce a nonce.
    pub fn seal(&self, session: &Session) -> Result<String, Error> {
        let message = serde_json::to_vec(session).map_err(|_| Error::EncodeError)?;

        let mut nonce = [0; 32];
        getrandom(&mut nonce).map_err(|_| Error::RngError)?;

        Ok(self.seal_message(&message, &nonce))
    }

    fn open_message(&self, value: &[u8]) -> Result<Vec<u8>, Error> {
        let body = value
            .strip_prefix(COOKIE_HEADER.as_bytes())
            .ok_or(Error::InvalidHeader)?;

        let message = match URL_SAFE_NO_PAD.decode(body) {
            Ok(d) if d.len() >= 64 => d,
            _ => return Err(Error::InvalidMessage),
        };

        let (nonce, remaining) = message.split_at(32);
        let (c, mac) = remaining.split_at(remaining.len() - 32);

        // unwrapping is safe here since key size has already been checked
        let (key, n2, auth_key) = split_key(&self.0, nonce).unwrap();

        let mac_expected = Blake2bMac::<U32>::new_from_slice(&auth_key)
            .unwrap()
            .chain_update(pre_auth_encode(&[COOKIE_HEADER.as_bytes(), nonce, c]))
            .finalize();

        // digest's CtOutput type provides constant-time comparison
        if mac_expected == GenericArray::<u8, U32>::from_slice(mac).into() {
            let mut p = c.to_vec();
            XChaCha20::new(&key.into(), &n2.into()).apply_keystream(&mut p);

            Ok(p)
        } else {
            Err(Error::AuthFailure)
        }
    }

    /// Open a sealed cookie value back into a session.
    ///
    /// # Errors
    ///
    /// Any malformed, truncated, or tampered value fails here; callers are
    /// expected to treat that as "no session".
    pub fn open(&self, value: &str) -> Result<Session, Error> {
        let message = self.open_message(value.as_bytes())?;

        serde_json::from_slice(&message).map_err(|_| Error::DecodeError)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Reads and writes sessions through the browser cookie jar.
///
/// Injected into request handlers instead of living in ambient state; holds
/// nothing but the cookie name and the process-lifetime key.
#[derive(Clone, Debug)]
pub struct SessionStore {
    name: String,
    key: SessionKey,
}

impl SessionStore {
    pub fn new(name: impl Into<String>, key: SessionKey) -> Self {
        Self {
            name: name.into(),
            key,
        }
    }

    /// The session presented by this request. Missing or undecodable cookies
    /// yield a fresh unauthenticated session; this never fails.
    pub fn load(&self, cookies: &Cookies) -> Session {
        cookies
            .get(&self.name)
            .and_then(|cookie| self.key.open(cookie.value()).ok())
            .unwrap_or_default()
    }

    /// Persist a session into the outgoing response. Must be called on every
    /// path that mutates session attributes, or the mutation is lost.
    pub fn save(&self, cookies: &Cookies, session: &Session) -> Result<(), Error> {
        let value = self.key.seal(session)?;

        let cookie = Cookie::build((self.name.clone(), value))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .max_age(Duration::days(COOKIE_MAX_AGE_DAYS))
            .build();
        cookies.add(cookie);

        Ok(())
    }
}

fn split_key(base_key: &[u8], split_nonce: &[u8]) -> Result<([u8; 32], [u8; 24], [u8; 32]), Error> {
    let enc_hash = Blake2bMac::<U56>::new_from_slice(base_key)
        .map_err(|_| Error::SizeError)?
        .chain_update([DOMAIN_ENCRYPT, split_nonce].concat())
        .finalize()
        .into_bytes();
    let (key, nonce) = enc_hash.split_at(32);

    let auth_key = Blake2bMac::<U32>::new_from_slice(base_key)
        .map_err(|_| Error::SizeError)?
        .chain_update([DOMAIN_AUTH, split_nonce].concat())
        .finalize()
        .into_bytes();

    // unwraps are safe here since hasher guarantees output size
    Ok((
        key.try_into().unwrap(),
        nonce.try_into().unwrap(),
        auth_key.into(),
    ))
}

// Length-prefixed concatenation, so no piece can masquerade as another.
fn pre_auth_encode(pieces: &[&[u8]]) -> Vec<u8> {
    let mut out = (pieces.len() as u64).to_le_bytes().to_vec();
    for piece in pieces {
        out.extend((piece.len() as u64).to_le_bytes());
        out.extend(*piece);
    }

    out
}
