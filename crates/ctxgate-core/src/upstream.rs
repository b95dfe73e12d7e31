use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;

use ctxgate_common::PassthroughError;

/// Headers the gateway never forwards upstream: hop-by-hop plumbing plus
/// inbound auth, which the auth layer replaces.
const STRIPPED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-authorization",
    "accept-encoding",
    "authorization",
    "x-api-key",
    "x-goog-api-key",
];

/// Thin wrapper over the shared upstream HTTP client. One instance per
/// process; request tasks clone the handle.
#[derive(Clone)]
pub struct UpstreamClient {
    client: wreq::Client,
}

impl UpstreamClient {
    pub fn new(timeout_secs: u64) -> Result<Self, String> {
        let client = wreq::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|err| err.to_string())?;
        Ok(Self { client })
    }

    pub async fn post(
        &self,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<wreq::Response, PassthroughError> {
        self.client
            .post(url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|err| PassthroughError::bad_gateway(err.to_string()))
    }
}

/// Inbound headers ready for forwarding: everything except hop-by-hop and
/// auth material.
pub fn forward_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound.iter() {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}
