use crate::error::ClientError;
use http::header::USER_AGENT;
use http::{HeaderValue, Request, Response};
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Adds the configured `User-Agent` to requests that do not carry one.
///
/// NTLM and Negotiate clients set `User-Agent: Windows` while signing; that
/// value is left alone.
#[derive(Clone)]
pub struct UserAgentLayer {
    user_agent: HeaderValue,
}

impl UserAgentLayer {
    /// # Errors
    /// Returns `ClientError::InvalidHeaderValue` if `user_agent` is not a valid header value
    pub fn try_new(user_agent: impl AsRef<str>) -> Result<Self, ClientError> {
        let user_agent = HeaderValue::from_str(user_agent.as_ref())?;
        Ok(Self { user_agent })
    }
}

impl<S> Layer<S> for UserAgentLayer {
    type Service = UserAgentService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        UserAgentService {
            inner,
            user_agent: self.user_agent.clone(),
        }
    }
}

#[derive(Clone)]
pub struct UserAgentService<S> {
    inner: S,
    user_agent: HeaderValue,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for UserAgentService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        if !req.headers().contains_key(USER_AGENT) {
            req.headers_mut().insert(USER_AGENT, self.user_agent.clone());
        }
        self.inner.call(req)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tower::ServiceExt;

    fn recording() -> (
        Arc<Mutex<Option<HeaderValue>>>,
        impl Service<
            Request<()>,
            Response = Response<()>,
            Error = ClientError,
            Future = std::future::Ready<Result<Response<()>, ClientError>>,
        > + Clone,
    ) {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let svc = tower::service_fn(move |req: Request<()>| {
            *sink.lock().unwrap() = req.headers().get(USER_AGENT).cloned();
            std::future::ready(Ok::<_, ClientError>(Response::new(())))
        });
        (seen, svc)
    }

    #[tokio::test]
    async fn test_default_user_agent_added() {
        let (seen, svc) = recording();
        let service = UserAgentLayer::try_new("qlik-sense-http/test").unwrap().layer(svc);

        service.oneshot(Request::new(())).await.unwrap();
        assert_eq!(seen.lock().unwrap().as_ref().unwrap(), "qlik-sense-http/test");
    }

    #[tokio::test]
    async fn test_windows_user_agent_kept() {
        let (seen, svc) = recording();
        let service = UserAgentLayer::try_new("qlik-sense-http/test").unwrap().layer(svc);

        let req = Request::builder()
            .header(USER_AGENT, "Windows")
            .body(())
            .unwrap();
        service.oneshot(req).await.unwrap();
        assert_eq!(seen.lock().unwrap().as_ref().unwrap(), "Windows");
    }

    #[test]
    fn test_invalid_user_agent() {
        assert!(matches!(
            UserAgentLayer::try_new("bad\x00agent"),
            Err(ClientError::InvalidHeaderValue(_))
        ));
    }
}
