use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Proxy};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::instrument;
use url::Url;

use crate::config::{AppSettings, PortalConfig};
use crate::error::{Result, ScrapeError};
use crate::retry::{ProxyPool, RetryPolicy};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Fully-read response; the body is buffered so retries can hand back owned values.
#[derive(Debug, Clone)]
pub struct PageResponse {
    pub status: u16,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl PageResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    Authenticated,
    /// The portal redirected to a second-factor page; the caller continues the challenge.
    MfaRequired(Url),
}

/// Minimum spacing between requests issued by one client instance.
#[derive(Debug)]
struct Throttle {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    async fn wait(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Cookie-backed session against one portal, driven by its declarative [`PortalConfig`].
///
/// Not meant to be shared between concurrent callers: requests are paced and the
/// authentication flag is per instance.
pub struct SessionClient {
    portal: PortalConfig,
    base: Url,
    jar: Arc<Jar>,
    client: Client,
    headers: RwLock<HeaderMap>,
    retry: RetryPolicy,
    proxies: ProxyPool,
    timeout: Duration,
    throttle: Throttle,
    authenticated: AtomicBool,
    debug_dir: Option<PathBuf>,
}

impl SessionClient {
    pub fn new(portal: PortalConfig, settings: &AppSettings) -> Result<Self> {
        Self::with_policy(
            portal,
            RetryPolicy::from(&settings.retry),
            ProxyPool::new(settings.proxies.clone()),
            settings.retry.timeout(),
            settings.debug_dir.clone(),
        )
    }

    pub fn with_policy(
        portal: PortalConfig,
        retry: RetryPolicy,
        proxies: ProxyPool,
        timeout: Duration,
        debug_dir: Option<PathBuf>,
    ) -> Result<Self> {
        tracing::info!(portal = %portal.base_url, "Initializing session client");
        let base = Url::parse(&portal.base_url)?;
        let jar = Arc::new(Jar::default());

        let mut headers = HeaderMap::new();
        for h in &portal.headers {
            headers.insert(header_name(&h.name)?, header_value(&h.value)?);
        }

        let client = build_client(&jar, None, timeout, portal.accept_invalid_certs)?;
        let throttle = Throttle::new(Duration::from_millis(portal.min_interval_ms));

        Ok(Self {
            portal,
            base,
            jar,
            client,
            headers: RwLock::new(headers),
            retry,
            proxies,
            timeout,
            throttle,
            authenticated: AtomicBool::new(false),
            debug_dir,
        })
    }

    pub fn portal(&self) -> &PortalConfig {
        &self.portal
    }

    pub fn url(&self, path: &str) -> String {
        self.portal.url(path)
    }

    /// Adds or replaces a header sent with every later request.
    pub fn set_header(&self, name: &str, value: &str) -> Result<()> {
        let (name, value) = (header_name(name)?, header_value(value)?);
        self.headers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, value);
        Ok(())
    }

    pub fn cookie(&self, name: &str) -> Option<String> {
        let raw = self.jar.cookies(&self.base)?;
        let raw = raw.to_str().ok()?;
        find_cookie(raw, name)
    }

    /// Token from the configured CSRF cookie; a missing cookie yields an empty token.
    pub fn csrf_token(&self) -> String {
        self.portal
            .login
            .csrf_cookie
            .as_deref()
            .and_then(|name| self.cookie(name))
            .map(|raw| decode_cookie_value(&raw))
            .unwrap_or_default()
    }

    pub async fn get(&self, url: &str) -> Result<PageResponse> {
        self.send(Method::GET, url, &[], None, HeaderMap::new()).await
    }

    pub async fn get_query(&self, url: &str, query: &[(String, String)]) -> Result<PageResponse> {
        self.send(Method::GET, url, query, None, HeaderMap::new()).await
    }

    pub async fn post_form(&self, url: &str, form: &[(String, String)]) -> Result<PageResponse> {
        self.send(Method::POST, url, &[], Some(form), HeaderMap::new())
            .await
    }

    pub async fn post_form_with(
        &self,
        url: &str,
        form: &[(String, String)],
        extra: HeaderMap,
    ) -> Result<PageResponse> {
        self.send(Method::POST, url, &[], Some(form), extra).await
    }

    /// Issues one request through the shared retry policy and the per-instance throttle.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(String, String)],
        form: Option<&[(String, String)]>,
        extra: HeaderMap,
    ) -> Result<PageResponse> {
        self.throttle.wait().await;
        let mut headers = self
            .headers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        headers.extend(extra);

        let start = Instant::now();
        let resp = self
            .retry
            .run(&self.proxies, |proxy| {
                self.attempt(proxy, method.clone(), url, query, form, headers.clone())
            })
            .await?;

        tracing::debug!(
            method = %method,
            url = %url,
            final_url = %resp.url,
            status = resp.status,
            duration = ?start.elapsed(),
            "Request completed"
        );
        Ok(resp)
    }

    async fn attempt(
        &self,
        proxy: Option<String>,
        method: Method,
        url: &str,
        query: &[(String, String)],
        form: Option<&[(String, String)]>,
        headers: HeaderMap,
    ) -> Result<PageResponse> {
        let client = match proxy.as_deref() {
            None => self.client.clone(),
            Some(p) => build_client(&self.jar, Some(p), self.timeout, self.portal.accept_invalid_certs)?,
        };

        let mut req = client.request(method, url).headers(headers);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(form) = form {
            req = req.form(form);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        let final_url = resp.url().clone();
        let headers = resp.headers().clone();
        let body = resp.bytes().await?.to_vec();

        if matches!(status, 502..=504) {
            return Err(ScrapeError::Status {
                status,
                url: final_url.to_string(),
            });
        }

        Ok(PageResponse {
            status,
            url: final_url,
            headers,
            body,
        })
    }

    fn at_login_page(&self, url: &Url) -> bool {
        let url = url.as_str();
        self.portal
            .login_markers
            .iter()
            .any(|m| !m.is_empty() && url.contains(m.as_str()))
    }

    /// Rejects responses that bounced to the login page or came back non-2xx.
    pub fn check(&self, resp: PageResponse) -> Result<PageResponse> {
        if self.at_login_page(&resp.url) {
            tracing::warn!(url = %resp.url, "Redirected to login page");
            self.authenticated.store(false, Ordering::SeqCst);
            return Err(ScrapeError::SessionExpired);
        }
        if !resp.is_success() {
            tracing::error!(url = %resp.url, status = resp.status, "Unexpected status");
            return Err(ScrapeError::Status {
                status: resp.status,
                url: resp.url.to_string(),
            });
        }
        Ok(resp)
    }

    /// Runs the portal's login sequence: token fetch, form post, optional verification.
    #[instrument(skip(self), fields(portal = %self.portal.base_url))]
    pub async fn login(&self) -> Result<LoginOutcome> {
        self.portal.require_credentials()?;
        let flow = &self.portal.login;

        if let Some(path) = &flow.token_path {
            let resp = self.get(&self.url(path)).await?;
            tracing::debug!(status = resp.status, "Fetched login page");
        }

        let csrf = self.csrf_token();
        if csrf.is_empty() && flow.csrf_cookie.is_some() {
            tracing::warn!("No CSRF cookie found, continuing with an empty token");
        }
        if let Some(name) = &flow.csrf_header {
            if !csrf.is_empty() {
                self.set_header(name, &csrf)?;
            }
        }

        let form: Vec<(String, String)> = flow
            .fields
            .iter()
            .map(|f| (f.name.clone(), self.portal.render(&f.value, &csrf)))
            .collect();

        let mut extra = HeaderMap::new();
        for h in &flow.headers {
            extra.insert(header_name(&h.name)?, header_value(&h.value)?);
        }
        if let Ok(origin) = HeaderValue::from_str(self.base.origin().ascii_serialization().as_str()) {
            extra.entry(header::ORIGIN).or_insert(origin);
        }

        let resp = self
            .post_form_with(&self.url(&flow.post_path), &form, extra)
            .await?;
        tracing::info!(status = resp.status, final_url = %resp.url, "Login form submitted");

        if let Some(marker) = &flow.mfa_marker {
            if resp.url.as_str().contains(marker.as_str()) {
                tracing::info!(url = %resp.url, "Second factor required");
                return Ok(LoginOutcome::MfaRequired(resp.url));
            }
        }

        if !resp.is_success() {
            tracing::error!(status = resp.status, "Login rejected");
            return Err(ScrapeError::Auth(format!("login returned status {}", resp.status)));
        }

        if flow.verify && !self.probe().await? {
            tracing::error!("Login verification failed");
            return Err(ScrapeError::Auth("session probe rejected after login".into()));
        }

        self.mark_authenticated();
        tracing::info!("Login successful");
        Ok(LoginOutcome::Authenticated)
    }

    pub fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
    }

    async fn probe(&self) -> Result<bool> {
        let Some(path) = &self.portal.probe_path else {
            return Ok(true);
        };
        let resp = self.get(&self.url(path)).await?;
        Ok(resp.is_success() && !self.at_login_page(&resp.url))
    }

    /// Live check against the probe page; portals without one rely on the last login.
    pub async fn is_authenticated(&self) -> Result<bool> {
        if self.portal.probe_path.is_none() {
            return Ok(self.authenticated.load(Ordering::SeqCst));
        }
        let ok = self.probe().await?;
        self.authenticated.store(ok, Ordering::SeqCst);
        Ok(ok)
    }

    /// Logs in when the session is missing or expired. Portals that demand a second
    /// factor cannot be recovered here and report an auth failure.
    pub async fn ensure_authenticated(&self) -> Result<()> {
        if self.is_authenticated().await? {
            return Ok(());
        }
        tracing::info!(portal = %self.portal.base_url, "Not authenticated, logging in");
        match self.login().await? {
            LoginOutcome::Authenticated => Ok(()),
            LoginOutcome::MfaRequired(_) => Err(ScrapeError::Auth(
                "portal requires an interactive second factor".into(),
            )),
        }
    }

    /// Runs a protected operation behind the authentication guard, re-logging in once
    /// when the operation reports an expired session.
    pub async fn protected<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.ensure_authenticated().await?;
        match op().await {
            Err(e) if e.is_auth() => {
                tracing::warn!(error = %e, "Session lost, re-authenticating once");
                self.authenticated.store(false, Ordering::SeqCst);
                self.ensure_authenticated().await?;
                op().await
            }
            other => other,
        }
    }

    /// Writes a raw body to the debug directory when one is configured.
    pub fn dump_debug(&self, label: &str, body: &[u8]) {
        let Some(dir) = &self.debug_dir else {
            return;
        };
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("{label}_{stamp}.html"));
        let result = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, body));
        match result {
            Ok(()) => tracing::debug!(path = %path.display(), "Saved debug dump"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Could not save debug dump"),
        }
    }
}

fn build_client(
    jar: &Arc<Jar>,
    proxy: Option<&str>,
    timeout: Duration,
    accept_invalid_certs: bool,
) -> Result<Client> {
    let mut builder = Client::builder()
        .cookie_provider(Arc::clone(jar))
        .user_agent(USER_AGENT)
        .timeout(timeout)
        .danger_accept_invalid_certs(accept_invalid_certs);
    if let Some(p) = proxy {
        builder = builder.proxy(Proxy::all(p).map_err(ScrapeError::Http)?);
    }
    builder.build().map_err(ScrapeError::Http)
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| ScrapeError::Config(format!("bad header name {name}: {e}")))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| ScrapeError::Config(format!("bad header value for {value}: {e}")))
}

/// Finds one cookie in a `name=value; name=value` header string.
pub fn find_cookie(raw: &str, name: &str) -> Option<String> {
    raw.split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
}

/// Percent-decodes a cookie value; framework XSRF cookies are URL-encoded.
pub fn decode_cookie_value(raw: &str) -> String {
    if !raw.contains('%') {
        return raw.to_string();
    }
    let encoded = format!("v={}", raw.replace('+', "%2B"));
    url::form_urlencoded::parse(encoded.as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| raw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_cookie_among_several() {
        let raw = "laravel_session=abc; XSRF-TOKEN=eyJpdiI6%3D%3D; other=1";
        assert_eq!(find_cookie(raw, "XSRF-TOKEN").as_deref(), Some("eyJpdiI6%3D%3D"));
        assert_eq!(find_cookie(raw, "missing"), None);
    }

    #[test]
    fn xsrf_cookie_is_percent_decoded() {
        assert_eq!(decode_cookie_value("eyJpdiI6%3D%3D"), "eyJpdiI6==");
        assert_eq!(decode_cookie_value("a+b%2Fc"), "a+b/c");
        assert_eq!(decode_cookie_value("plain-token"), "plain-token");
    }

    fn test_client(markers: &[&str]) -> SessionClient {
        let settings = AppSettings::load(None).unwrap();
        let mut portal = settings.erp_site().unwrap().portal.clone();
        portal.login_markers = markers.iter().map(|m| m.to_string()).collect();
        SessionClient::with_policy(
            portal,
            RetryPolicy::default(),
            ProxyPool::default(),
            Duration::from_secs(5),
            None,
        )
        .unwrap()
    }

    fn response(url: &str, status: u16) -> PageResponse {
        PageResponse {
            status,
            url: Url::parse(url).unwrap(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    #[test]
    fn redirect_to_login_marks_session_expired() {
        let client = test_client(&["login"]);
        client.mark_authenticated();
        let err = client
            .check(response("https://erp.ringassur.fr/login", 200))
            .unwrap_err();
        assert!(matches!(err, ScrapeError::SessionExpired));
        assert!(!client.authenticated.load(Ordering::SeqCst));

        let err = client
            .check(response("https://erp.ringassur.fr/contracts", 500))
            .unwrap_err();
        assert!(matches!(err, ScrapeError::Status { status: 500, .. }));
        assert!(client
            .check(response("https://erp.ringassur.fr/contracts", 200))
            .is_ok());
    }

    #[test]
    fn missing_csrf_cookie_is_empty_token() {
        let client = test_client(&["login"]);
        assert_eq!(client.csrf_token(), "");
    }

    #[test]
    fn set_header_rejects_invalid_values() {
        let client = test_client(&[]);
        assert!(client.set_header("X-XSRF-TOKEN", "abc").is_ok());
        assert!(client.set_header("X-XSRF-TOKEN", "bad\nvalue").is_err());
    }

    #[test]
    fn headers_survive_a_poisoned_lock() {
        let client = test_client(&[]);
        let poisoned = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = client.headers.write().unwrap();
            panic!("writer died");
        }));
        assert!(poisoned.is_err());
        assert!(client.headers.is_poisoned());

        client.set_header("X-XSRF-TOKEN", "abc").unwrap();
        let headers = client.headers.read().unwrap_or_else(PoisonError::into_inner);
        assert_eq!(headers.get("x-xsrf-token").unwrap(), "abc");
    }

    #[tokio::test]
    async fn throttle_spaces_consecutive_calls() {
        let throttle = Throttle::new(Duration::from_millis(50));
        let start = Instant::now();
        throttle.wait().await;
        throttle.wait().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
