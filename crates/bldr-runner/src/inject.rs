//! Injection proxy.
//!
//! A local HTTP intermediary between the tunnel and the dev server. HTML
//! responses get a helper script inserted before `</body>` so the browser
//! side of a tunneled preview can talk back to the build UI; everything
//! else passes through untouched. Dev-server responses are small, so
//! bodies are buffered rather than streamed.

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Script inserted into proxied HTML pages. Marks the document as served
/// through a bldr tunnel and relays element picks to the parent frame.
const HELPER_SCRIPT: &str = r#"<script>
(function () {
  if (window.__bldrHelper) return;
  window.__bldrHelper = true;
  document.addEventListener("click", function (event) {
    if (!window.__bldrPickMode) return;
    event.preventDefault();
    event.stopPropagation();
    var el = event.target;
    window.parent.postMessage({
      type: "bldr-element-picked",
      tag: el.tagName.toLowerCase(),
      id: el.id || null,
      classes: el.className || null,
      text: (el.textContent || "").slice(0, 200)
    }, "*");
  }, true);
})();
</script>"#;

/// How long a graceful proxy shutdown may take before it is abandoned.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// Insert the helper script before the closing body tag.
///
/// Falls back to appending when no `</body>` exists; matching is
/// case-insensitive on the last occurrence.
pub fn rewrite_html(html: &str) -> String {
    let lower = html.to_lowercase();
    match lower.rfind("</body>") {
        Some(pos) => {
            let mut out = String::with_capacity(html.len() + HELPER_SCRIPT.len());
            out.push_str(&html[..pos]);
            out.push_str(HELPER_SCRIPT);
            out.push_str(&html[pos..]);
            out
        }
        None => {
            let mut out = String::with_capacity(html.len() + HELPER_SCRIPT.len());
            out.push_str(html);
            out.push_str(HELPER_SCRIPT);
            out
        }
    }
}

/// A running injection proxy.
pub struct InjectionProxy {
    pub port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl InjectionProxy {
    /// Bind the proxy on `listen_port` and forward to the dev server on
    /// `upstream_port`.
    pub async fn start(listen_port: u16, upstream_port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", listen_port))
            .await
            .with_context(|| format!("binding injection proxy on port {}", listen_port))?;

        let client: Client<HttpConnector, Full<Bytes>> =
            Client::builder(TokioExecutor::new()).build_http();

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _addr)) = accepted else { continue };
                        let client = client.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                proxy_request(req, client.clone(), upstream_port)
                            });
                            if let Err(e) = hyper::server::conn::http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                debug!("Injection proxy connection error: {}", e);
                            }
                        });
                    }
                }
            }
        });

        info!(
            "Injection proxy on port {} -> dev server {}",
            listen_port, upstream_port
        );

        Ok(Self {
            port: listen_port,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Stop accepting and wind down, bounded by the shutdown timeout.
    /// Idempotent.
    pub async fn stop(&mut self) {
        let Some(shutdown) = self.shutdown.take() else {
            return;
        };
        let _ = shutdown.send(());

        if let Some(task) = self.task.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await.is_err() {
                warn!("Injection proxy on port {} did not stop in time", self.port);
            }
        }
    }
}

async fn proxy_request(
    req: Request<Incoming>,
    client: Client<HttpConnector, Full<Bytes>>,
    upstream_port: u16,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match forward(req, client, upstream_port).await {
        Ok(response) => Ok(response),
        Err(e) => {
            warn!("Injection proxy upstream error: {:#}", e);
            let mut response = Response::new(Full::new(Bytes::from("upstream unavailable")));
            *response.status_mut() = StatusCode::BAD_GATEWAY;
            Ok(response)
        }
    }
}

async fn forward(
    req: Request<Incoming>,
    client: Client<HttpConnector, Full<Bytes>>,
    upstream_port: u16,
) -> Result<Response<Full<Bytes>>> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let uri: Uri = format!("http://127.0.0.1:{}{}", upstream_port, path_and_query)
        .parse()
        .context("building upstream uri")?;

    let (parts, body) = req.into_parts();
    let body = body.collect().await.context("reading request body")?.to_bytes();

    let mut upstream_req = Request::builder().method(parts.method).uri(uri);
    for (name, value) in parts.headers.iter() {
        if name != HOST {
            upstream_req = upstream_req.header(name, value);
        }
    }
    let upstream_req = upstream_req
        .body(Full::new(body))
        .context("building upstream request")?;

    let upstream_res = client
        .request(upstream_req)
        .await
        .context("forwarding to dev server")?;

    let (mut res_parts, res_body) = upstream_res.into_parts();
    let body_bytes = res_body
        .collect()
        .await
        .context("reading upstream body")?
        .to_bytes();

    let is_html = res_parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/html"))
        .unwrap_or(false);
    let is_encoded = res_parts.headers.contains_key(CONTENT_ENCODING);

    let body_bytes = if is_html && !is_encoded {
        match std::str::from_utf8(&body_bytes) {
            Ok(html) => {
                let rewritten = rewrite_html(html);
                res_parts.headers.remove(CONTENT_LENGTH);
                Bytes::from(rewritten)
            }
            Err(_) => body_bytes,
        }
    } else {
        body_bytes
    };

    Ok(Response::from_parts(res_parts, Full::new(body_bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_inserts_before_body_close() {
        let html = "<html><body><h1>hi</h1></body></html>";
        let out = rewrite_html(html);
        let script_pos = out.find("__bldrHelper").unwrap();
        let body_pos = out.find("</body>").unwrap();
        assert!(script_pos < body_pos);
        assert!(out.ends_with("</body></html>"));
    }

    #[test]
    fn test_rewrite_case_insensitive() {
        let html = "<HTML><BODY>x</BODY></HTML>";
        let out = rewrite_html(html);
        assert!(out.contains("__bldrHelper"));
        let script_pos = out.find("__bldrHelper").unwrap();
        let body_pos = out.find("</BODY>").unwrap();
        assert!(script_pos < body_pos);
    }

    #[test]
    fn test_rewrite_appends_without_body_tag() {
        let html = "plain fragment";
        let out = rewrite_html(html);
        assert!(out.starts_with("plain fragment"));
        assert!(out.contains("__bldrHelper"));
    }
}
