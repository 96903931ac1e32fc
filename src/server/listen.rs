//! Listen-URL resolution and the accept loops.
//!
//! `PROFILE_RECORDER_SERVER_URL` names the listen address directly;
//! `PROFILE_RECORDER_SERVER_URL_PATTERN` may carry `{PID}` and `{UUID}`
//! tokens, useful when several profiled processes share a socket directory.
//! Accepted schemes: `http://host:port`, `unix:///path`, `http+unix:///path`.

use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use tokio_util::sync::CancellationToken;

use crate::server::router::Router;
use crate::server::service::serve_connection;

pub const URL_ENV: &str = "PROFILE_RECORDER_SERVER_URL";
pub const URL_PATTERN_ENV: &str = "PROFILE_RECORDER_SERVER_URL_PATTERN";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenUrl {
    Http(String),
    Unix(PathBuf),
}

impl std::fmt::Display for ListenUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenUrl::Http(addr) => write!(f, "http://{addr}"),
            ListenUrl::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

pub fn parse_listen_url(url: &str) -> Result<ListenUrl, String> {
    if let Some(addr) = url.strip_prefix("http://") {
        let addr = addr.trim_end_matches('/');
        if addr.is_empty() {
            return Err(format!("no address in listen url {url:?}"));
        }
        return Ok(ListenUrl::Http(addr.to_string()));
    }
    for scheme in ["unix://", "http+unix://"] {
        if let Some(path) = url.strip_prefix(scheme) {
            if path.is_empty() {
                return Err(format!("no socket path in listen url {url:?}"));
            }
            return Ok(ListenUrl::Unix(PathBuf::from(path)));
        }
    }
    Err(format!(
        "unsupported listen url {url:?}; expected http://, unix:// or http+unix://"
    ))
}

fn substitute_tokens(pattern: &str) -> String {
    let mut url = pattern.replace("{PID}", &std::process::id().to_string());
    if url.contains("{UUID}") {
        url = url.replace("{UUID}", &uuid::Uuid::new_v4().to_string());
    }
    url
}

/// The listen URL from the environment, or the default loopback address.
pub fn resolve_listen_url() -> Result<ListenUrl, String> {
    if let Ok(url) = std::env::var(URL_ENV) {
        return parse_listen_url(&url);
    }
    if let Ok(pattern) = std::env::var(URL_PATTERN_ENV) {
        return parse_listen_url(&substitute_tokens(&pattern));
    }
    Ok(ListenUrl::Http("127.0.0.1:8080".to_string()))
}

/// Accepts connections until `shutdown` fires.
pub async fn serve(
    listen: ListenUrl,
    router: Arc<Router>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!("profile recorder listening on {listen}");
    match listen {
        ListenUrl::Http(addr) => {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, _peer) = accepted?;
                        let router = router.clone();
                        tokio::spawn(serve_connection(stream, router));
                    }
                    _ = shutdown.cancelled() => return Ok(()),
                }
            }
        }
        ListenUrl::Unix(path) => {
            // A stale socket file from a previous run blocks the bind.
            let _ = std::fs::remove_file(&path);
            let listener = tokio::net::UnixListener::bind(&path)?;
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, _peer) = accepted?;
                        let router = router.clone();
                        tokio::spawn(serve_connection(stream, router));
                    }
                    _ = shutdown.cancelled() => {
                        let _ = std::fs::remove_file(&path);
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_three_schemes() {
        assert_eq!(
            parse_listen_url("http://127.0.0.1:9000").unwrap(),
            ListenUrl::Http("127.0.0.1:9000".to_string())
        );
        assert_eq!(
            parse_listen_url("unix:///tmp/prof.sock").unwrap(),
            ListenUrl::Unix(PathBuf::from("/tmp/prof.sock"))
        );
        assert_eq!(
            parse_listen_url("http+unix:///tmp/prof.sock").unwrap(),
            ListenUrl::Unix(PathBuf::from("/tmp/prof.sock"))
        );
        assert!(parse_listen_url("ftp://x").is_err());
        assert!(parse_listen_url("http://").is_err());
    }

    #[test]
    fn pattern_tokens_are_substituted() {
        let url = substitute_tokens("unix:///tmp/prof-{PID}-{UUID}.sock");
        assert!(url.contains(&std::process::id().to_string()));
        assert!(!url.contains("{PID}"));
        assert!(!url.contains("{UUID}"));
    }
}
