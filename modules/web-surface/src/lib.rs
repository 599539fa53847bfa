//! HTTP header probing for web ports the banner rules could not name.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info};
use recon_core::{HostPortWrite, HttpHeaders, HttpProbe, PortStatus, ResultStore, TCP};
use reqwest::{redirect::Policy, Client};
use std::time::Duration;

/// Ports worth an HTTP GET when no service was identified.
pub const HTTP_PORTS: [u16; 12] = [80, 280, 443, 591, 593, 4180, 8000, 8008, 8080, 8443, 8990, 8991];

/// Headers that tend to name the server software, in report order.
pub const SERVER_HEADERS: [&str; 3] = ["Server", "X-Powered-By", "Via"];

pub const REASON_HTTP: &str = "http-get-probe";
pub const HTTP_SERVICE: &str = "http";

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub redirects: usize,
    pub user_agent: String,
}

impl Default for HttpOptions {
    fn default() -> Self {
        HttpOptions { redirects: 5, user_agent: format!("recon/{}", recon_core::version()) }
    }
}

/// `HttpProbe` over a shared reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestProbe {
    client: Client,
}

impl ReqwestProbe {
    pub fn new(opts: &HttpOptions) -> Result<Self> {
        let client = Client::builder()
            .redirect(Policy::limited(opts.redirects))
            .user_agent(opts.user_agent.clone())
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .context("build http client")?;
        Ok(ReqwestProbe { client })
    }
}

#[async_trait]
impl HttpProbe for ReqwestProbe {
    async fn get(&self, url: &str, timeout: Duration) -> Result<HttpHeaders> {
        let resp = self.client.get(url).timeout(timeout).send().await?;
        debug!("GET {} -> {}", url, resp.status());
        Ok(resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect())
    }
}

/// `"Server: nginx/1.18 - Via: 1.1 proxy"` for whichever server headers are
/// present, matched without regard to case. `None` when there are none.
pub fn summarize_server_headers(headers: &HttpHeaders) -> Option<String> {
    let parts: Vec<String> = SERVER_HEADERS
        .iter()
        .filter_map(|name| {
            headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| format!("{}: {}", name, v))
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" - "))
    }
}

/// GET `http://<address>:<port>/` and summarise the server headers. Any
/// failure along the way means no answer.
pub async fn http_version_probe(
    probe: &dyn HttpProbe,
    address: &str,
    port: u16,
    timeout: Duration,
) -> Option<String> {
    let url = format!("http://{}:{}/", address, port);
    match probe.get(&url, timeout).await {
        Ok(headers) => {
            let summary = summarize_server_headers(&headers);
            match &summary {
                Some(s) => info!("HTTP service on {}:{}: {}", address, port, s),
                None => debug!("{} answered without server headers", url),
            }
            summary
        }
        Err(e) => {
            debug!("HTTP probe of {} failed: {:#}", url, e);
            None
        }
    }
}

/// Record `address:port` as an open HTTP service described by `summary`.
pub fn record_http_service(store: &dyn ResultStore, address: &str, port: u16, summary: &str) -> Result<()> {
    let host_id = store.upsert_host(address, None)?;
    let port_id = store.upsert_port(port, TCP)?;
    let service_id = store.upsert_service(HTTP_SERVICE, Some(summary))?;
    store.upsert_host_port(&HostPortWrite {
        host_id,
        port_id,
        status: PortStatus::Open,
        reason: REASON_HTTP,
        service_id: Some(service_id),
        banner: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::mock::StaticHttp;
    use results_sqlite::Db;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn headers(pairs: &[(&str, &str)]) -> HttpHeaders {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn summary_keeps_header_order_and_ignores_case() {
        let h = headers(&[("via", "1.1 varnish"), ("content-type", "text/html"), ("server", "nginx/1.18.0")]);
        assert_eq!(summarize_server_headers(&h).unwrap(), "Server: nginx/1.18.0 - Via: 1.1 varnish");
        assert_eq!(summarize_server_headers(&headers(&[("date", "today")])), None);
    }

    #[tokio::test]
    async fn probe_builds_the_root_url() {
        let http = StaticHttp::new().page("http://10.0.0.5:8080/", &[("Server", "Apache"), ("X-Powered-By", "PHP/8.2")]);
        let got = http_version_probe(&http, "10.0.0.5", 8080, Duration::from_secs(1)).await;
        assert_eq!(got.as_deref(), Some("Server: Apache - X-Powered-By: PHP/8.2"));
        assert_eq!(http_version_probe(&http, "10.0.0.5", 80, Duration::from_secs(1)).await, None);
        assert_eq!(http.requested(), vec!["http://10.0.0.5:8080/", "http://10.0.0.5:80/"]);
    }

    #[tokio::test]
    async fn reqwest_probe_reads_live_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await;
            let resp = "HTTP/1.1 200 OK\r\nServer: nginx/1.18.0\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
            sock.write_all(resp.as_bytes()).await.unwrap();
        });

        let probe = ReqwestProbe::new(&HttpOptions::default()).unwrap();
        let got = http_version_probe(&probe, "127.0.0.1", port, Duration::from_secs(5)).await;
        assert_eq!(got.as_deref(), Some("Server: nginx/1.18.0"));
    }

    #[test]
    fn http_service_record() {
        let db = Db::open_in_memory().unwrap();
        record_http_service(&db, "10.0.0.5", 80, "Server: nginx/1.18").unwrap();
        let rec = db.port_record("10.0.0.5", 80).unwrap().unwrap();
        assert_eq!((rec.status, rec.reason.as_str()), (PortStatus::Open, REASON_HTTP));
        assert_eq!(rec.service_name.as_deref(), Some("http"));
        assert!(rec.service_version.unwrap().contains("nginx/1.18"));
    }
}
