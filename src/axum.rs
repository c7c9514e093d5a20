//! Axum integration utilities.
//!
//! [`AuthenticateLayer`] verifies the bearer token and attaches an
//! [`AuthContext`] to the request; [`PolicyLayer`] enforces a [`Policy`]
//! against it. Handlers can take [`AuthContext`] as an extractor.

use std::fmt;
use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::credential_store::CredentialStore;
use crate::error::Error;
use crate::guard::{AuthContext, Policy, authenticate, bearer_token};
use crate::token::TokenEngine;

use ::axum::body::Body;
use ::axum::extract::FromRequestParts;
use ::axum::response::{IntoResponse, Response};
use ::http::header::AUTHORIZATION;
use ::http::request::Parts;
use ::http::{HeaderMap, Request, StatusCode};
use ::tower::{Layer, Service};
use tracing::warn;

/// Rejection produced by the auth middleware and extractor.
#[derive(Debug)]
pub struct AuthRejection {
    status: StatusCode,
    message: &'static str,
}

impl AuthRejection {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<&Error> for AuthRejection {
    fn from(err: &Error) -> Self {
        let (status, message) = match err {
            Error::Unauthorized => (StatusCode::UNAUTHORIZED, "authentication required"),
            Error::InvalidToken | Error::Revoked => (StatusCode::UNAUTHORIZED, "invalid token"),
            Error::Forbidden(_) => (StatusCode::FORBIDDEN, "insufficient permissions"),
            Error::StoreUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service unavailable")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal error"),
        };
        Self { status, message }
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .filter(|ctx| ctx.is_authenticated())
            .cloned()
            .ok_or_else(|| AuthRejection::from(&Error::Unauthorized))
    }
}

/// Middleware layer that verifies bearer tokens with a [`TokenEngine`].
pub struct AuthenticateLayer<C> {
    engine: Arc<TokenEngine<C>>,
}

impl<C> AuthenticateLayer<C> {
    pub fn new(engine: Arc<TokenEngine<C>>) -> Self {
        Self { engine }
    }
}

impl<C> Clone for AuthenticateLayer<C> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<C> fmt::Debug for AuthenticateLayer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticateLayer").finish_non_exhaustive()
    }
}

impl<C, Inner> Layer<Inner> for AuthenticateLayer<C> {
    type Service = AuthenticateService<Inner, C>;

    fn layer(&self, inner: Inner) -> Self::Service {
        AuthenticateService {
            inner,
            engine: Arc::clone(&self.engine),
        }
    }
}

/// Middleware service that attaches an [`AuthContext`] or rejects the request.
pub struct AuthenticateService<Inner, C> {
    inner: Inner,
    engine: Arc<TokenEngine<C>>,
}

impl<Inner: Clone, C> Clone for AuthenticateService<Inner, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<Inner, C> Service<Request<Body>> for AuthenticateService<Inner, C>
where
    Inner: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    C: CredentialStore + 'static,
{
    type Response = Response;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let engine = Arc::clone(&self.engine);

        Box::pin(async move {
            let Some(token) = header_token(req.headers()) else {
                return Ok(AuthRejection::from(&Error::Unauthorized).into_response());
            };
            match authenticate(&engine, &token).await {
                Ok(ctx) => {
                    req.extensions_mut().insert(ctx);
                    poll_fn(|cx| inner.poll_ready(cx)).await?;
                    inner.call(req).await
                }
                Err(err) => {
                    if err.is_store_unavailable() {
                        warn!(error = %err, "token verification unavailable");
                    }
                    Ok(AuthRejection::from(&err).into_response())
                }
            }
        })
    }
}

/// Middleware layer that enforces a [`Policy`] on the request's [`AuthContext`].
#[derive(Debug, Clone)]
pub struct PolicyLayer {
    policy: Arc<Policy>,
}

impl PolicyLayer {
    pub fn new(policy: Policy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }
}

impl<Inner> Layer<Inner> for PolicyLayer {
    type Service = PolicyService<Inner>;

    fn layer(&self, inner: Inner) -> Self::Service {
        PolicyService {
            inner,
            policy: Arc::clone(&self.policy),
        }
    }
}

/// Middleware service that answers 401/403 when the policy fails.
#[derive(Debug, Clone)]
pub struct PolicyService<Inner> {
    inner: Inner,
    policy: Arc<Policy>,
}

impl<Inner> Service<Request<Body>> for PolicyService<Inner>
where
    Inner: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
{
    type Response = Response;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let policy = Arc::clone(&self.policy);

        Box::pin(async move {
            let principal = req
                .extensions()
                .get::<AuthContext>()
                .and_then(AuthContext::principal);
            match policy.check(principal) {
                Ok(()) => {
                    poll_fn(|cx| inner.poll_ready(cx)).await?;
                    inner.call(req).await
                }
                Err(err) => Ok(AuthRejection::from(&err).into_response()),
            }
        })
    }
}

fn header_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    bearer_token(value).map(str::to_string)
}
