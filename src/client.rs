//! High-level execution: drive a [`Provider`] over HTTP.
//!
//! The adapters themselves never touch the network; this layer posts the
//! prepared bodies, surfaces non-success statuses, and wires streaming
//! responses into the token stream. Adapters do not retry at the HTTP
//! layer; stream retries are confined to frame-decoding hiccups and
//! governed by the injected [`RetryStrategy`].

use std::collections::HashMap;
use std::sync::Arc;

use futures::TryStreamExt;

use crate::capabilities::{registry, StreamingConfig};
use crate::error::Error;
use crate::providers::{resolve_model, OptionMap, Provider};
use crate::stream::{
    cancel_pair, CancelHandle, ExponentialBackoff, Framing, RetryStrategy, TokenStream,
};
use crate::types::{Request, Response};
use crate::{BoxStream, Result};

/// A provider bound to an HTTP client.
pub struct LlmClient {
    provider: Arc<dyn Provider>,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            http: reqwest::Client::new(),
        }
    }

    /// Use a caller-configured `reqwest` client (proxies, timeouts, TLS).
    pub fn with_http_client(provider: Arc<dyn Provider>, http: reqwest::Client) -> Self {
        Self { provider, http }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// One-shot generation.
    pub async fn generate(&self, req: &Request) -> Result<Response> {
        self.generate_with(req, &OptionMap::new()).await
    }

    pub async fn generate_with(&self, req: &Request, options: &OptionMap) -> Result<Response> {
        let body = self.provider.prepare_request(req, options)?;
        let response = self.post(body).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        self.provider.parse_response(&bytes)
    }

    /// Streaming generation. Returns the token stream plus a handle that
    /// cancels it cooperatively; the stream must still be closed (or
    /// dropped) to release the connection.
    pub async fn stream(&self, req: &Request) -> Result<(TokenStream, CancelHandle)> {
        self.stream_with(req, &OptionMap::new(), Box::<ExponentialBackoff>::default())
            .await
    }

    pub async fn stream_with(
        &self,
        req: &Request,
        options: &OptionMap,
        retry: Box<dyn RetryStrategy>,
    ) -> Result<(TokenStream, CancelHandle)> {
        let body = self.provider.prepare_stream_request(req, options)?;
        let framing = self.framing_for(req, options);
        let response = self.post(body).await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(
            provider = self.provider.name(),
            status = status.as_u16(),
            "stream opened"
        );

        let bytes: BoxStream<'static, bytes::Bytes> =
            Box::pin(response.bytes_stream().map_err(Error::from));
        let (handle, cancel_rx) = cancel_pair();
        let stream = TokenStream::new(bytes, Arc::clone(&self.provider), framing, retry, cancel_rx);
        Ok((stream, handle))
    }

    /// Wire framing from the registered streaming descriptor when the model
    /// is known; otherwise by vendor (Ollama is the lone NDJSON speaker).
    fn framing_for(&self, req: &Request, options: &OptionMap) -> Framing {
        let model = resolve_model("", req, options);
        if !model.is_empty() {
            if let Ok(cfg) = registry().get_typed::<StreamingConfig>(self.provider.name(), &model)
            {
                return if cfg.supports_sse {
                    Framing::Sse
                } else {
                    Framing::Ndjson
                };
            }
        }
        if self.provider.name() == crate::providers::OLLAMA {
            Framing::Ndjson
        } else {
            Framing::Sse
        }
    }

    async fn post(&self, body: Vec<u8>) -> Result<reqwest::Response> {
        let mut request = self.http.post(self.provider.endpoint()).body(body);
        for (key, value) in self.provider.headers() {
            request = request.header(key, value);
        }
        request.send().await.map_err(Error::from)
    }
}

/// Convenience constructor: provider by name plus a fresh HTTP client.
pub fn client_for(
    provider_name: &str,
    api_key: &str,
    model: &str,
    extra_headers: Option<HashMap<String, String>>,
) -> Result<LlmClient> {
    let provider = crate::providers::create_provider(provider_name, api_key, model, extra_headers)?;
    Ok(LlmClient::new(provider))
}
