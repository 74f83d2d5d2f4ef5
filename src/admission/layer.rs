//! Tower middleware applying admission decisions to HTTP requests.

use futures::future::BoxFuture;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Request, Response, StatusCode};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::warn;

use super::{Admission, Decision, EndpointPolicy, RateLimitMetadata};
use crate::ratelimit::RequestIdentity;

/// Applies an endpoint's rate limit policy to every request it receives.
///
/// The identity is read from the [`RequestIdentity`] request extension set
/// by the authentication layer; requests without one are treated as
/// anonymous callers with no known address and are not limited.
#[derive(Clone)]
pub struct AdmissionLayer {
    admission: Arc<Admission>,
    policy: Arc<EndpointPolicy>,
}

impl AdmissionLayer {
    pub fn new(admission: Arc<Admission>, policy: EndpointPolicy) -> Self {
        for problem in policy.config.problems() {
            warn!(
                endpoint = %policy.endpoint,
                problem = %problem,
                "Unusable rate limit override; the global default applies"
            );
        }

        Self {
            admission,
            policy: Arc::new(policy),
        }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            admission: self.admission.clone(),
            policy: self.policy.clone(),
        }
    }
}

/// Service produced by [`AdmissionLayer`].
#[derive(Clone)]
pub struct AdmissionService<S> {
    inner: S,
    admission: Arc<Admission>,
    policy: Arc<EndpointPolicy>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: From<String> + Send + 'static,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<ReqBody>) -> Self::Future {
        let admission = self.admission.clone();
        let policy = self.policy.clone();
        // Take the service that was driven to readiness
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            let method = request.method().clone();
            let identity = request
                .extensions()
                .get::<RequestIdentity>()
                .cloned()
                .unwrap_or_default();

            match admission.evaluate(&method, &policy, &identity).await {
                Decision::Bypassed => inner.call(request).await,
                Decision::Rejected(metadata) => Ok(too_many_requests(&metadata)),
                Decision::Allowed(admitted) => {
                    if let Some(metadata) = &admitted.metadata {
                        request.extensions_mut().insert(metadata.clone());
                    }

                    // A dropped guard still releases, so cancellation and
                    // panics in the handler are covered as well.
                    let result = inner.call(request).await;
                    if let Some(slot) = admitted.slot {
                        slot.release().await;
                    }

                    let mut response = result?;
                    if let Some(metadata) = admitted.metadata {
                        metadata.apply_headers(response.headers_mut());
                    }
                    Ok(response)
                }
            }
        })
    }
}

fn too_many_requests<B: From<String>>(metadata: &RateLimitMetadata) -> Response<B> {
    let body = serde_json::json!({ "detail": metadata.detail() }).to_string();
    let mut response = Response::new(B::from(body));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    metadata.apply_headers(response.headers_mut());
    response
}
