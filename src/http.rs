//! Policy-checked outbound HTTP.
//!
//! Every request, and every redirect hop, is validated with
//! [`security::assert_safe`](crate::security::assert_safe) before a socket is
//! opened. Redirects are followed manually so each `Location` is checked on
//! its own, and connections are pinned to the addresses the validator saw
//! so DNS cannot change between check and connect. No retries.

use std::net::SocketAddr;
use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use reqwest::{Method, StatusCode};
use url::Url;

use crate::error::{GatewayError, Result, SecurityError};
use crate::security::{self, UrlPolicy, ValidatedUrl};

const USER_AGENT: &str = concat!("changelog-gateway/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Whole-request timeout per hop.
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub max_redirects: usize,
    pub max_body_bytes: usize,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            max_redirects: 5,
            max_body_bytes: 5 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// URL of the final hop.
    pub url: Url,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct SafeHttpClient {
    policy: UrlPolicy,
}

impl SafeHttpClient {
    pub fn new(policy: UrlPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &UrlPolicy {
        &self.policy
    }

    pub async fn get(&self, url: &str, headers: HeaderMap, options: &RequestOptions) -> Result<HttpResponse> {
        self.request(Method::GET, url, headers, None, options).await
    }

    pub async fn request(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<String>,
        options: &RequestOptions,
    ) -> Result<HttpResponse> {
        let mut current = Url::parse(url).map_err(|e| SecurityError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let mut method = method;
        let mut headers = headers;
        let mut body = body;
        let mut hops = 0usize;

        loop {
            let validated = self.validate(current.clone()).await?;
            let client = pinned_client(&validated, options)?;

            let mut request = client
                .request(method.clone(), validated.url.clone())
                .headers(headers.clone());
            if let Some(b) = &body {
                request = request.body(b.clone());
            }

            let response = request
                .send()
                .await
                .map_err(|e| GatewayError::Upstream(format!("request to {} failed: {}", host_of(&current), e)))?;
            let status = response.status();

            if status.is_redirection() {
                if let Some(location) = response.headers().get(LOCATION) {
                    if hops >= options.max_redirects {
                        return Err(SecurityError::RedirectLimit(options.max_redirects).into());
                    }
                    hops += 1;

                    let location = location
                        .to_str()
                        .map_err(|_| SecurityError::BadRedirect("non-ASCII Location".to_string()))?;
                    let next = current
                        .join(location)
                        .map_err(|e| SecurityError::BadRedirect(format!("{}: {}", location, e)))?;

                    if switches_to_get(status, &method) {
                        method = Method::GET;
                        body = None;
                        headers.remove(CONTENT_TYPE);
                        headers.remove(CONTENT_LENGTH);
                    }
                    if !same_origin(&current, &next) {
                        headers.remove(AUTHORIZATION);
                    }

                    tracing::debug!(status = status.as_u16(), from = %current, to = %next, hop = hops, "following redirect");
                    current = next;
                    continue;
                }
            }

            let response_headers = response.headers().clone();
            let final_url = response.url().clone();
            let body = read_body(response, options.max_body_bytes).await?;

            return Ok(HttpResponse {
                status,
                headers: response_headers,
                url: final_url,
                body,
            });
        }
    }

    /// Runs the policy check on the blocking pool since the resolver may
    /// perform a blocking DNS lookup.
    async fn validate(&self, url: Url) -> Result<ValidatedUrl> {
        let policy = self.policy.clone();
        let validated = tokio::task::spawn_blocking(move || security::assert_safe(&url, &policy))
            .await
            .map_err(|e| GatewayError::Upstream(format!("URL validation task failed: {}", e)))??;
        Ok(validated)
    }
}

fn pinned_client(validated: &ValidatedUrl, options: &RequestOptions) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(options.timeout)
        .connect_timeout(options.connect_timeout)
        .user_agent(USER_AGENT)
        .no_proxy();

    if let Some(host) = &validated.host {
        let port = validated.url.port_or_known_default().unwrap_or(443);
        let addrs: Vec<SocketAddr> = validated
            .addrs
            .iter()
            .map(|ip| SocketAddr::new(*ip, port))
            .collect();
        builder = builder.resolve_to_addrs(host, &addrs);
    }

    builder
        .build()
        .map_err(|e| GatewayError::Upstream(format!("failed to build HTTP client: {}", e)))
}

async fn read_body(mut response: reqwest::Response, limit: usize) -> Result<String> {
    let mut buf: Vec<u8> = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| GatewayError::Upstream(format!("failed to read response body: {}", e)))?
    {
        if buf.len() + chunk.len() > limit {
            return Err(GatewayError::Upstream(format!(
                "response body exceeds {} bytes",
                limit
            )));
        }
        buf.extend_from_slice(&chunk);
    }
    String::from_utf8(buf).map_err(|_| GatewayError::Upstream("response body is not UTF-8".to_string()))
}

fn switches_to_get(status: StatusCode, method: &Method) -> bool {
    status == StatusCode::SEE_OTHER
        || ((status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND)
            && *method != Method::GET
            && *method != Method::HEAD)
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

fn host_of(url: &Url) -> &str {
    url.host_str().unwrap_or("<no host>")
}
