//! Request pipeline: session cookie, provider families, then require-auth.
//!
//! ```text
//! session_middleware -> wrapper N -> ... -> wrapper 1 -> require_auth -> handler
//! ```

use axum::{
    extract::{Request, State},
    http::{
        HeaderMap, HeaderValue, Method, StatusCode,
        header::{ACCEPT, CONTENT_TYPE, LOCATION, SET_COOKIE},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{future::Future, pin::Pin, sync::Arc};
use tracing::debug;
use url::form_urlencoded;

use super::{
    actor::{Actor, AnonymousAccess},
    cookies::{SESSION_COOKIE, SIGN_OUT_COOKIE, cookie_value},
    error::AuthError,
    flow::{oauth, oidc, saml},
    httpheader,
    redirect::safe_redirect_url,
    state::AuthState,
};

pub type InterceptFuture = Pin<Box<dyn Future<Output = Result<Response, Request>> + Send>>;

/// Serve the request (`Ok`) or hand it, possibly annotated, to the next
/// stage (`Err`).
pub type Intercept = fn(Arc<AuthState>, Request) -> InterceptFuture;

/// Which of its two variants a provider wrapper runs for a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Surface {
    Api,
    App,
}

impl Surface {
    #[must_use]
    pub fn of(path: &str) -> Self {
        if path.starts_with("/.api/") || path == "/.api" {
            Self::Api
        } else {
            Self::App
        }
    }
}

/// One provider family's pair of wrappers.
#[derive(Clone, Copy)]
pub struct ProviderMiddleware {
    pub name: &'static str,
    pub api: Intercept,
    pub app: Intercept,
}

impl ProviderMiddleware {
    const fn intercept(&self, surface: Surface) -> Intercept {
        match surface {
            Surface::Api => self.api,
            Surface::App => self.app,
        }
    }
}

fn pass_through(_state: Arc<AuthState>, req: Request) -> InterceptFuture {
    Box::pin(async move { Err(req) })
}

fn oauth_app(state: Arc<AuthState>, req: Request) -> InterceptFuture {
    Box::pin(oauth::intercept(state, req))
}

fn oidc_app(state: Arc<AuthState>, req: Request) -> InterceptFuture {
    Box::pin(oidc::intercept(state, req))
}

fn saml_app(state: Arc<AuthState>, req: Request) -> InterceptFuture {
    Box::pin(saml::intercept(state, req))
}

fn http_header(state: Arc<AuthState>, req: Request) -> InterceptFuture {
    Box::pin(httpheader::intercept(state, req))
}

/// Wrappers of every built-in family, innermost first.
#[must_use]
pub fn default_wrappers() -> Vec<ProviderMiddleware> {
    vec![
        ProviderMiddleware {
            name: "oauth",
            api: pass_through,
            app: oauth_app,
        },
        ProviderMiddleware {
            name: "openidconnect",
            api: pass_through,
            app: oidc_app,
        },
        ProviderMiddleware {
            name: "saml",
            api: pass_through,
            app: saml_app,
        },
        ProviderMiddleware {
            name: "http-header",
            api: http_header,
            app: http_header,
        },
    ]
}

/// Provider wrappers composed in front of the require-auth policy.
#[derive(Clone)]
pub struct AuthMiddleware {
    state: Arc<AuthState>,
    wrappers: Arc<[ProviderMiddleware]>,
}

impl AuthMiddleware {
    #[must_use]
    pub fn new(state: Arc<AuthState>) -> Self {
        Self::with_wrappers(state, default_wrappers())
    }

    #[must_use]
    pub fn with_wrappers(state: Arc<AuthState>, wrappers: Vec<ProviderMiddleware>) -> Self {
        Self {
            state,
            wrappers: wrappers.into(),
        }
    }
}

/// Resolve the session cookie into an [`Actor`] extension.
///
/// Runs before every other auth stage. A session backend failure fails the
/// request closed.
pub async fn session_middleware(
    State(state): State<Arc<AuthState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let auth = match state.sessions().authenticate(req.headers()).await {
        Ok(auth) => auth,
        Err(err) => return AuthError::from(err).into_response(),
    };
    req.extensions_mut().insert(auth.actor);
    let mut response = next.run(req).await;
    // A handler that replaced the session owns the session cookie.
    if sets_session_cookie(response.headers()) {
        return response;
    }
    for cookie in auth.set_cookies {
        response.headers_mut().append(SET_COOKIE, cookie);
    }
    response
}

fn sets_session_cookie(headers: &HeaderMap) -> bool {
    let prefix = format!("{SESSION_COOKIE}=");
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.starts_with(&prefix))
}

pub async fn auth_middleware(
    State(middleware): State<AuthMiddleware>,
    req: Request,
    next: Next,
) -> Response {
    let surface = Surface::of(req.uri().path());
    let mut req = req;
    for wrapper in middleware.wrappers.iter().rev() {
        match (wrapper.intercept(surface))(Arc::clone(&middleware.state), req).await {
            Ok(response) => {
                debug!(family = wrapper.name, "request served by provider wrapper");
                return response;
            }
            Err(passed) => req = passed,
        }
    }
    require_auth(&middleware.state, req, next).await
}

const ALLOWED_ROUTES: [&str; 10] = [
    "/sign-in",
    "/sign-up",
    "/password-reset",
    "/-/sign-in",
    "/-/sign-out",
    "/favicon.ico",
    "/robots.txt",
    "/healthz",
    "/__version",
    "/.api/auth/providers",
];

const ALLOWED_PREFIXES: [&str; 5] = [
    "/.auth/",
    "/.assets/",
    "/.api/webhooks",
    "/.api/lsif/upload",
    "/.api/scip/upload",
];

/// Routes reachable without authentication.
///
/// Paths with empty, `.` or `..` segments never match.
#[must_use]
pub fn is_allowlisted(path: &str) -> bool {
    if path.contains("//")
        || path.contains("/./")
        || path.contains("/../")
        || path.ends_with("/.")
        || path.ends_with("/..")
    {
        return false;
    }
    ALLOWED_ROUTES.contains(&path) || ALLOWED_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
}

/// Status for unauthenticated API requests, overridden per route.
fn unauthenticated_status(path: &str) -> StatusCode {
    // Raw file routes answer as if the file did not exist.
    if path.contains("/-/raw/") || path.ends_with("/-/raw") {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::UNAUTHORIZED
    }
}

fn accepts_html(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"))
}

fn request_target(req: &Request) -> String {
    let uri = req.uri();
    let target = uri
        .path_and_query()
        .map_or_else(|| uri.path().to_string(), ToString::to_string);
    safe_redirect_url(&target)
}

fn append_query(url: &str, key: &str, value: &str) -> String {
    let pair: String = form_urlencoded::Serializer::new(String::new())
        .append_pair(key, value)
        .finish();
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{pair}")
}

fn redirect(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(LOCATION, value)]).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Let authenticated or anonymous-accessible requests through; otherwise
/// answer 401/404 on the API and redirect to sign-in in the app.
pub async fn require_auth(state: &AuthState, req: Request, next: Next) -> Response {
    let actor = req.extensions().get::<Actor>().copied().unwrap_or_default();
    let path = req.uri().path();
    if actor.is_authenticated()
        || is_allowlisted(path)
        || req.extensions().get::<AnonymousAccess>().is_some()
        || state.public_access()
    {
        return next.run(req).await;
    }

    let status = unauthenticated_status(path);
    if Surface::of(path) == Surface::Api || status == StatusCode::NOT_FOUND {
        let message = if status == StatusCode::NOT_FOUND {
            "Not found."
        } else {
            "Private mode requires authentication."
        };
        return (status, [(CONTENT_TYPE, "text/plain; charset=utf-8")], message).into_response();
    }

    let return_to = request_target(&req);
    let browser_get = req.method() == Method::GET && accepts_html(req.headers());
    let signed_out = cookie_value(req.headers(), SIGN_OUT_COOKIE).is_some();
    if browser_get && !signed_out {
        // Skip the sign-in page only when a single SSO provider is the sole
        // way in.
        let providers = state.registry().providers().await;
        if let [provider] = providers.as_slice() {
            if provider.is_sso() {
                let login = append_query(
                    &provider.cached_info().authentication_url,
                    "redirect",
                    &return_to,
                );
                return redirect(&login);
            }
        }
    }
    redirect(&append_query("/sign-in", "returnTo", &return_to))
}
