// tests/support/mod.rs
//! Minimal HTTP/1.1 responder on a loopback port, recording every request it serves.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use portal_scrape::AppSettings;

#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub target: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl Request {
    pub fn path(&self) -> &str {
        self.target.split('?').next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
}

impl Reply {
    pub fn ok(body: &str) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn redirect(location: &str) -> Self {
        Self {
            status: 302,
            headers: vec![("Location".into(), location.into())],
            body: String::new(),
        }
    }

    pub fn cookie(mut self, name: &str, value: &str) -> Self {
        self.headers
            .push(("Set-Cookie".into(), format!("{name}={value}; Path=/")));
        self
    }
}

pub struct StubServer {
    pub base: String,
    requests: Arc<Mutex<Vec<Request>>>,
}

impl StubServer {
    pub async fn start<F>(route: F) -> Self
    where
        F: Fn(&Request) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let route = Arc::new(route);

        let log = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let (route, log) = (Arc::clone(&route), Arc::clone(&log));
                tokio::spawn(async move {
                    let mut stream = BufReader::new(stream);
                    let Some(request) = read_request(&mut stream).await else {
                        return;
                    };
                    let reply = route(&request);
                    log.lock().unwrap().push(request);

                    let mut head = format!(
                        "HTTP/1.1 {} STUB\r\nContent-Length: {}\r\nConnection: close\r\n",
                        reply.status,
                        reply.body.len()
                    );
                    for (name, value) in &reply.headers {
                        head.push_str(&format!("{name}: {value}\r\n"));
                    }
                    head.push_str("\r\n");
                    let stream = stream.get_mut();
                    let _ = stream.write_all(head.as_bytes()).await;
                    let _ = stream.write_all(reply.body.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        Self { base, requests }
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, method: &str, path: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == method && r.path() == path)
            .count()
    }
}

async fn read_request<S>(stream: &mut BufReader<S>) -> Option<Request>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    stream.read_line(&mut line).await.ok()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        stream.read_line(&mut line).await.ok()?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }

    let length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = vec![0; length];
    stream.read_exact(&mut body).await.ok()?;

    Some(Request {
        method,
        target,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

/// Built-in settings with the named portals pointed at `base`, credentials filled in
/// and retries made immediate.
pub fn settings_for(base: &str) -> AppSettings {
    let mut settings = AppSettings::load(None).unwrap();
    settings.retry.delay_ms = 0;
    settings.retry.timeout_secs = 5;
    settings.proxies.clear();
    settings.debug_dir = None;

    if let Some(erp) = settings.erp.as_mut() {
        erp.portal.base_url = base.to_string();
        erp.portal.username = "agent@ringassur.fr".into();
        erp.portal.password = "secret".into();
        erp.portal.login.headers.clear();
        erp.state_path = None;
    }
    if let Some(neo) = settings.neo.as_mut() {
        neo.portal.base_url = base.to_string();
        neo.portal.username = "courtier".into();
        neo.portal.password = "secret".into();
        neo.portal.headers.clear();
    }
    settings
}
