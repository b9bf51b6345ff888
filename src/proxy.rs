//! The forward primitive: relaying a request to the backend origin.

use std::net::IpAddr;

use axum::{
    body::Body,
    extract::Request,
    http::{
        header::{self, HeaderMap, HeaderName},
        Response,
    },
};
use futures::TryStreamExt;
use thiserror::Error;

/// Headers that describe the connection rather than the payload; they must
/// not survive a proxy hop in either direction.
const HOP_BY_HOP: [HeaderName; 7] = [
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Errors while relaying a request to the backend.
#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("invalid backend origin: {0}")]
    Origin(String),
    #[error("failed to construct http client: {0}")]
    Client(String),
    #[error("error talking to backend: {0}")]
    Upstream(String),
}

/// Relays requests to the single configured backend origin, adjusting only
/// the standard proxy headers. Responses pass through unmodified.
///
/// No timeout or retry is applied; backend slowness surfaces directly to the
/// client, bounded by the transport alone.
#[derive(Clone, Debug)]
pub struct Forwarder {
    origin: reqwest::Url,
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new(backend_url: &str) -> Result<Self, ForwardError> {
        let origin =
            reqwest::Url::parse(backend_url).map_err(|e| ForwardError::Origin(e.to_string()))?;

        // The backend's redirects belong to the client, not to the proxy.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ForwardError::Client(e.to_string()))?;

        Ok(Self { origin, client })
    }

    /// Forward `req` to the backend and relay its response.
    pub async fn forward(
        &self,
        peer: IpAddr,
        req: Request,
    ) -> Result<Response<Body>, ForwardError> {
        let (parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };

        let mut url = self.origin.clone();
        url.set_path(&join_paths(self.origin.path(), path));
        url.set_query(query);

        // A bodyless request must not grow a chunked body on the way through.
        let has_body = parts.headers.contains_key(header::CONTENT_LENGTH)
            || parts.headers.contains_key(header::TRANSFER_ENCODING);

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        // reqwest derives Host from the target URL
        headers.remove(header::HOST);
        append_forwarded_for(&mut headers, peer);

        let mut request = self.client.request(parts.method, url).headers(headers);
        if has_body {
            request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let upstream = request
            .send()
            .await
            .map_err(|e| ForwardError::Upstream(e.to_string()))?;

        let status = upstream.status();
        let mut response_headers = upstream.headers().clone();
        strip_hop_by_hop(&mut response_headers);

        let stream = upstream.bytes_stream().map_err(std::io::Error::other);
        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = response_headers;

        Ok(response)
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Connection may nominate additional per-hop headers by name.
    let nominated: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();
    for name in nominated {
        headers.remove(name);
    }
    headers.remove(header::CONNECTION);

    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: IpAddr) {
    let forwarded = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {peer}"),
        None => peer.to_string(),
    };

    if let Ok(value) = forwarded.parse() {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

// Join the origin path and the request path around exactly one slash, the
// way Go's httputil reverse proxy does.
fn join_paths(a: &str, b: &str) -> String {
    match (a.ends_with('/'), b.starts_with('/')) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => format!("{a}/{b}"),
        _ => format!("{a}{b}"),
    }
}
