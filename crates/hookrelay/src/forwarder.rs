use std::time::Duration;

use hookrelay_common::{is_hop_by_hop, TunnelError};
use hookrelay_protocol::{ForwardRequest, ForwardResponse, Headers, MAX_BODY_SIZE};

/// Executes forwarded requests against the local service
#[derive(Clone)]
pub struct LocalForwarder {
    base_url: String,
    preserve_path: bool,
    timeout: Duration,
    max_body_size: usize,
    client: reqwest::Client,
}

impl LocalForwarder {
    pub fn new(
        base_url: impl Into<String>,
        preserve_path: bool,
        timeout: Duration,
    ) -> Result<Self, TunnelError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .timeout(timeout)
            // Redirects belong to the original caller
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| TunnelError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into(),
            preserve_path,
            timeout,
            max_body_size: MAX_BODY_SIZE,
            client,
        })
    }

    /// Cap on local response bodies; larger ones become a 500
    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Where a request with the given path and query is sent
    pub fn target_url(&self, uri: &str) -> String {
        if self.preserve_path && !uri.is_empty() && uri != "/" {
            format!("{}{}", self.base_url.trim_end_matches('/'), uri)
        } else {
            self.base_url.clone()
        }
    }

    /// Run one forwarded request, always producing a response
    ///
    /// Local failures (refused, timed out, ...) come back as a 500 carrying
    /// the original correlation id and a description of what went wrong.
    pub async fn execute(&self, request: ForwardRequest) -> ForwardResponse {
        let id = request.id.clone();
        match self.forward_http(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Local call for {} failed: {}", id, e);
                ForwardResponse {
                    id,
                    status: 500,
                    headers: vec![("Content-Type", "text/plain; charset=utf-8")]
                        .into_iter()
                        .collect(),
                    body: e.to_string().into_bytes(),
                }
            }
        }
    }

    /// Send the request to the local service
    pub async fn forward_http(
        &self,
        request: ForwardRequest,
    ) -> Result<ForwardResponse, TunnelError> {
        let url = self.target_url(&request.uri);
        tracing::debug!("Forwarding {} {} -> {}", request.method, request.uri, url);

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|_| TunnelError::LocalCall(format!("invalid method '{}'", request.method)))?;

        let mut builder = self.client.request(method, &url);
        for (name, value) in request.headers.iter() {
            // reqwest derives Host and Content-Length from the target and body
            if is_hop_by_hop(name)
                || name.eq_ignore_ascii_case("host")
                || name.eq_ignore_ascii_case("content-length")
            {
                continue;
            }
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let mut response = builder.send().await.map_err(|e| self.describe(&url, e))?;

        let status = response.status().as_u16();
        let mut headers = Headers::new();
        for (name, value) in response.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            headers.append(
                name.as_str(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            );
        }

        if response
            .content_length()
            .is_some_and(|len| len > self.max_body_size as u64)
        {
            return Err(self.body_too_large(&url));
        }

        // Content-Length may be absent, so the cap is enforced while reading too
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.describe(&url, e))? {
            if body.len() + chunk.len() > self.max_body_size {
                return Err(self.body_too_large(&url));
            }
            body.extend_from_slice(&chunk);
        }

        tracing::debug!("Local response for {}: {} ({} bytes)", request.id, status, body.len());

        Ok(ForwardResponse {
            id: request.id,
            status,
            headers,
            body,
        })
    }

    fn body_too_large(&self, url: &str) -> TunnelError {
        TunnelError::LocalCall(format!(
            "response body too large: {} sent more than {} bytes",
            url, self.max_body_size
        ))
    }

    fn describe(&self, url: &str, err: reqwest::Error) -> TunnelError {
        if err.is_timeout() {
            TunnelError::LocalCall(format!(
                "{} did not answer within {:?}",
                url, self.timeout
            ))
        } else if err.is_connect() {
            TunnelError::LocalCall(format!("could not connect to {}: {}", url, err))
        } else {
            TunnelError::LocalCall(format!("request to {} failed: {}", url, err))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookrelay_protocol::CorrelationId;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one raw HTTP response to the first connection
    async fn one_shot_server(response: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(&response).await;
            let _ = stream.shutdown().await;
        });
        format!("http://{}/", addr)
    }

    fn get(id: &str) -> ForwardRequest {
        ForwardRequest {
            id: CorrelationId::from(id),
            method: "GET".to_string(),
            uri: "/".to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    fn forwarder(preserve_path: bool) -> LocalForwarder {
        LocalForwarder::new(
            "http://127.0.0.1:3000/hook/",
            preserve_path,
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_target_url() {
        assert_eq!(
            forwarder(false).target_url("/webhook?x=1"),
            "http://127.0.0.1:3000/hook/"
        );
        assert_eq!(
            forwarder(true).target_url("/webhook?x=1"),
            "http://127.0.0.1:3000/hook/webhook?x=1"
        );
        assert_eq!(forwarder(true).target_url(""), "http://127.0.0.1:3000/hook/");
    }

    #[tokio::test]
    async fn test_unreachable_target_becomes_500() {
        // Port 9 on localhost is essentially never listening
        let forwarder =
            LocalForwarder::new("http://127.0.0.1:9/", false, Duration::from_secs(2)).unwrap();
        let response = forwarder
            .execute(ForwardRequest {
                id: CorrelationId::from("abc"),
                method: "GET".to_string(),
                uri: "/".to_string(),
                headers: Headers::new(),
                body: Vec::new(),
            })
            .await;

        assert_eq!(response.id.as_str(), "abc");
        assert_eq!(response.status, 500);
        let body = String::from_utf8(response.body).unwrap();
        assert!(body.starts_with("Local call failed"), "body: {}", body);
    }

    #[tokio::test]
    async fn test_oversized_declared_body_becomes_500() {
        let mut raw = b"HTTP/1.1 200 OK\r\nContent-Length: 64\r\n\r\n".to_vec();
        raw.extend_from_slice(&[b'x'; 64]);
        let url = one_shot_server(raw).await;

        let forwarder = LocalForwarder::new(url, false, Duration::from_secs(2))
            .unwrap()
            .with_max_body_size(16);
        let response = forwarder.execute(get("big")).await;

        assert_eq!(response.id.as_str(), "big");
        assert_eq!(response.status, 500);
        let body = String::from_utf8(response.body).unwrap();
        assert!(body.contains("response body too large"), "body: {}", body);
    }

    #[tokio::test]
    async fn test_oversized_undeclared_body_becomes_500() {
        // No Content-Length: the body runs until the connection closes
        let mut raw = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n".to_vec();
        raw.extend_from_slice(&[b'x'; 64]);
        let url = one_shot_server(raw).await;

        let forwarder = LocalForwarder::new(url, false, Duration::from_secs(2))
            .unwrap()
            .with_max_body_size(16);
        let response = forwarder.execute(get("stream")).await;

        assert_eq!(response.status, 500);
        assert!(String::from_utf8_lossy(&response.body).contains("response body too large"));
    }

    #[tokio::test]
    async fn test_body_within_limit_is_kept() {
        let url = one_shot_server(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok".to_vec()).await;

        let forwarder = LocalForwarder::new(url, false, Duration::from_secs(2))
            .unwrap()
            .with_max_body_size(16);
        let response = forwarder.execute(get("small")).await;

        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"ok");
    }

    #[tokio::test]
    async fn test_invalid_method_is_a_local_failure() {
        let response = forwarder(false)
            .execute(ForwardRequest {
                id: CorrelationId::from("m"),
                method: "BAD METHOD".to_string(),
                uri: "/".to_string(),
                headers: Headers::new(),
                body: Vec::new(),
            })
            .await;
        assert_eq!(response.status, 500);
    }
}
