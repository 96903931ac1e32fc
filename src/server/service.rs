//! The HTTP control surface: a thin router over the sampling core.

use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, warn};
use serde_derive::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::render::OutputFormat;
use crate::sampler::{run_session, SessionProps, SymbolizerChoice};
use crate::server::router::{RouteRequest, RouteResponse, Router};
use crate::shared::interval::parse_interval;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SampleRequestBody {
    number_of_samples: u32,
    time_interval: String,
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    symbolizer: Option<String>,
}

/// Builds the standard route table: sampling on `POST /`, `/sample` and
/// `/samples`, the pprof endpoint under `/debug/pprof/profile`, and a
/// health check.
pub fn profiler_router() -> Router {
    let mut router = Router::new();

    for slug in [&[][..], &["sample"][..], &["samples"][..]] {
        router.register(slug, |request| {
            if request.method != "POST" {
                return None;
            }
            Some(handle_sample_request(request))
        });
    }

    router.register(&["debug", "pprof", "profile"], |request| {
        if request.method != "GET" {
            return None;
        }
        Some(handle_pprof_request(request))
    });

    router.register(&["health"], |_request| Some(RouteResponse::ok_text("OK")));

    router
}

fn session_props_from_body(body: &[u8]) -> Result<SessionProps, String> {
    let body: SampleRequestBody =
        serde_json::from_slice(body).map_err(|err| format!("bad request body: {err}"))?;

    let interval =
        parse_interval(&body.time_interval, "ms").map_err(|err| format!("bad timeInterval: {err}"))?;
    let format = match &body.format {
        None => OutputFormat::default(),
        Some(name) => {
            OutputFormat::parse(name).ok_or_else(|| format!("unknown format {name:?}"))?
        }
    };
    let symbolizer = match &body.symbolizer {
        None => SymbolizerChoice::default(),
        Some(name) => {
            SymbolizerChoice::parse(name).ok_or_else(|| format!("unknown symbolizer {name:?}"))?
        }
    };

    Ok(SessionProps {
        sample_count: body.number_of_samples,
        interval,
        format,
        symbolizer,
        ..SessionProps::default()
    })
}

fn run_session_response(props: SessionProps) -> RouteResponse {
    debug!(
        "running a session: {} samples every {:?} as {:?}",
        props.sample_count, props.interval, props.format
    );
    let cancel = CancellationToken::new();
    let mut sink = Vec::new();
    match run_session(&props, &cancel, &mut sink) {
        Ok(_stats) => RouteResponse::bytes(props.format.content_type(), sink),
        Err(err) => {
            warn!("session failed: {err}");
            RouteResponse::error(500, format!("profiling session failed: {err}\n"))
        }
    }
}

fn handle_sample_request(request: &RouteRequest) -> RouteResponse {
    match session_props_from_body(&request.body) {
        Ok(props) => run_session_response(props),
        Err(message) => RouteResponse::error(400, format!("{message}\n")),
    }
}

fn handle_pprof_request(request: &RouteRequest) -> RouteResponse {
    let seconds = query_number(request, "seconds", 30).clamp(1, 1000);
    let rate = query_number(request, "rate", 100).clamp(1, 1000);

    let props = SessionProps {
        sample_count: seconds * rate,
        interval: Duration::from_nanos(1_000_000_000 / rate as u64),
        format: OutputFormat::Pprof,
        symbolizer: SymbolizerChoice::Native,
        ..SessionProps::default()
    };
    run_session_response(props)
}

fn query_number(request: &RouteRequest, key: &str, default: u32) -> u32 {
    request
        .query
        .get(key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

/// Serves one accepted connection. Router dispatch runs on the blocking
/// pool because a sampling session sleeps and signals for its whole
/// duration.
pub async fn serve_connection<S>(stream: S, router: Arc<Router>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |request| handle_http(request, router.clone()));
    if let Err(err) = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .await
    {
        debug!("connection error: {err}");
    }
}

async fn handle_http(
    request: Request<Incoming>,
    router: Arc<Router>,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let method = request.method().to_string();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let response = match request.into_body().collect().await {
        Ok(body) => {
            let route_request = RouteRequest::new(&method, &path_and_query)
                .with_body(body.to_bytes().to_vec());
            tokio::task::spawn_blocking(move || router.handle(&route_request))
                .await
                .unwrap_or_else(|_| RouteResponse::error(500, "request handler panicked\n"))
        }
        Err(err) => RouteResponse::error(400, format!("could not read request body: {err}\n")),
    };

    let mut http_response = Response::new(Full::new(Bytes::from(response.body)));
    *http_response.status_mut() =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    http_response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(response.content_type));
    Ok(http_response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_body_parses_with_defaults() {
        let props = session_props_from_body(
            br#"{"numberOfSamples": 50, "timeInterval": "10ms"}"#,
        )
        .unwrap();
        assert_eq!(props.sample_count, 50);
        assert_eq!(props.interval, Duration::from_millis(10));
        assert_eq!(props.format, OutputFormat::PerfScript);
        assert_eq!(props.symbolizer, SymbolizerChoice::Native);
    }

    #[test]
    fn bare_interval_number_defaults_to_milliseconds() {
        let props =
            session_props_from_body(br#"{"numberOfSamples": 1, "timeInterval": "10"}"#).unwrap();
        assert_eq!(props.interval, Duration::from_millis(10));
    }

    #[test]
    fn format_and_symbolizer_are_honored() {
        let props = session_props_from_body(
            br#"{"numberOfSamples": 1, "timeInterval": "1s", "format": "collapsed", "symbolizer": "fake"}"#,
        )
        .unwrap();
        assert_eq!(props.format, OutputFormat::Collapsed);
        assert_eq!(props.symbolizer, SymbolizerChoice::Fake);
    }

    #[test]
    fn bad_bodies_are_rejected() {
        assert!(session_props_from_body(b"not json").is_err());
        assert!(session_props_from_body(
            br#"{"numberOfSamples": 1, "timeInterval": "10 fortnights"}"#
        )
        .is_err());
        assert!(session_props_from_body(
            br#"{"numberOfSamples": 1, "timeInterval": "1s", "format": "gif"}"#
        )
        .is_err());
    }

    #[test]
    fn health_route_answers_ok() {
        let router = profiler_router();
        let response = router.handle(&RouteRequest::new("GET", "/health"));
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"OK");
    }

    #[test]
    fn sample_routes_decline_get() {
        let router = profiler_router();
        // GET on a sampling slug falls through to the 404 handler.
        let response = router.handle(&RouteRequest::new("GET", "/sample"));
        assert_eq!(response.status, 404);
    }

    #[test]
    fn pprof_route_clamps_its_parameters() {
        let request = RouteRequest::new("GET", "/debug/pprof/profile?seconds=0&rate=99999");
        assert_eq!(query_number(&request, "seconds", 30).clamp(1, 1000), 1);
        assert_eq!(query_number(&request, "rate", 100).clamp(1, 1000), 1000);
        let request = RouteRequest::new("GET", "/debug/pprof/profile");
        assert_eq!(query_number(&request, "seconds", 30), 30);
        assert_eq!(query_number(&request, "rate", 100), 100);
    }
}
