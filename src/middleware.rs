//! Per-request tracing context.
//!
//! [`RequestContextLayer`] opens a span for every request, continues any
//! inbound W3C trace, and exposes the request's endpoint/host/method to code
//! running inside the handler through [`with_request_info`].

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use axum::{extract::Request, http::HeaderMap, response::Response};
use opentelemetry::propagation::Extractor;
use std::future::Future;
use tower::{Layer, Service};
use tracing::{Instrument, debug, span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

tokio::task_local! {
    pub static REQUEST_CONTEXT: RequestContext;
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub endpoint: String,
    pub host: String,
    pub method: String,
}

/// Runs `f` against the current request's context, or an empty context when
/// called outside of a request.
pub fn with_request_info<F, R>(f: F) -> R
where
    F: Fn(&RequestContext) -> R,
{
    REQUEST_CONTEXT.try_with(|r| f(r)).unwrap_or_else(|_| {
        static DEFAULT_CTX: RequestContext = RequestContext {
            endpoint: String::new(),
            host: String::new(),
            method: String::new(),
        };
        f(&DEFAULT_CTX)
    })
}

struct HeaderExtractor<'a> {
    headers: &'a HeaderMap,
}

impl<'a> Extractor for HeaderExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers
            .get(key)
            .and_then(|header| header.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|h| h.as_str()).collect()
    }
}

#[derive(Debug, Clone)]
pub struct RequestContextService<S> {
    inner: S,
}

impl<S, ReqBody> Service<Request<ReqBody>> for RequestContextService<S>
where
    S: Service<Request<ReqBody>, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    // Boxed because `.instrument()` changes the inner future's type.
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let parent_context = opentelemetry::global::get_text_map_propagator(|propagator| {
            propagator.extract(&HeaderExtractor {
                headers: req.headers(),
            })
        });

        let ctx = RequestContext {
            endpoint: req.uri().path().to_string(),
            method: req.method().to_string(),
            host: req
                .headers()
                .get("x-forwarded-host")
                .or_else(|| req.headers().get("host"))
                .and_then(|h| h.to_str().ok())
                .unwrap_or("")
                .to_string(),
        };

        let request_span = span!(
            tracing::Level::INFO,
            "request",
            method = %ctx.method,
            endpoint = %ctx.endpoint
        );

        if let Err(err) = request_span.set_parent(parent_context) {
            debug!(
                error = debug(err),
                "unable to set otel parent, span will be new instead"
            );
        }

        let fut = self.inner.call(req);
        Box::pin(async move {
            REQUEST_CONTEXT
                .scope(ctx, async move {
                    let response = fut.instrument(request_span).await;

                    if let Ok(ref res) = response {
                        let status = res.status();
                        with_request_info(|ctx| {
                            tracing::info!(
                                endpoint = %ctx.endpoint,
                                host = %ctx.host,
                                httpMethod = %ctx.method,
                                status = %status.as_u16(),
                                "request to {} finished",
                                ctx.endpoint
                            );
                        });
                    }

                    response
                })
                .await
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct RequestContextLayer;

impl RequestContextLayer {
    pub fn new() -> Self {
        RequestContextLayer
    }
}

impl<S> Layer<S> for RequestContextLayer {
    type Service = RequestContextService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestContextService { inner }
    }
}
