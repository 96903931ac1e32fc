//! A small claim-or-decline router. Handlers are registered under a path
//! slug and consulted in registration order; the first one that returns a
//! response wins. A request no handler claims gets a 404 with a copy-paste
//! `curl` example.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub method: String,
    pub path_segments: Vec<String>,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl RouteRequest {
    pub fn new(method: &str, path: &str) -> RouteRequest {
        let (path, query) = match path.split_once('?') {
            Some((path, query)) => (path, query),
            None => (path, ""),
        };
        RouteRequest {
            method: method.to_string(),
            path_segments: path
                .split('/')
                .filter(|segment| !segment.is_empty())
                .map(|segment| segment.to_string())
                .collect(),
            query: parse_query(query),
            body: Vec::new(),
        }
    }

    pub fn with_body(mut self, body: Vec<u8>) -> RouteRequest {
        self.body = body;
        self
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
}

impl RouteResponse {
    pub fn ok_text(body: impl Into<String>) -> RouteResponse {
        RouteResponse {
            status: 200,
            content_type: "text/plain; charset=utf-8",
            body: body.into().into_bytes(),
        }
    }

    pub fn bytes(content_type: &'static str, body: Vec<u8>) -> RouteResponse {
        RouteResponse {
            status: 200,
            content_type,
            body,
        }
    }

    pub fn error(status: u16, body: impl Into<String>) -> RouteResponse {
        RouteResponse {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into().into_bytes(),
        }
    }
}

/// A handler may decline a request by returning `None`, in which case the
/// router keeps trying later registrations on the same slug.
pub type Handler = Box<dyn Fn(&RouteRequest) -> Option<RouteResponse> + Send + Sync>;

#[derive(Default)]
pub struct Router {
    routes: Vec<(Vec<String>, Handler)>,
}

impl Router {
    pub fn new() -> Router {
        Router::default()
    }

    pub fn register<H>(&mut self, slug: &[&str], handler: H)
    where
        H: Fn(&RouteRequest) -> Option<RouteResponse> + Send + Sync + 'static,
    {
        let slug = slug.iter().map(|s| s.to_string()).collect();
        self.routes.push((slug, Box::new(handler)));
    }

    pub fn handle(&self, request: &RouteRequest) -> RouteResponse {
        for (slug, handler) in &self.routes {
            if slug[..] != request.path_segments[..] {
                continue;
            }
            if let Some(response) = handler(request) {
                return response;
            }
        }
        RouteResponse::error(404, not_found_body(request))
    }
}

fn not_found_body(request: &RouteRequest) -> String {
    format!(
        "No handler for {} /{}.\n\n\
         Record ten samples at a 10ms cadence:\n\n  \
         curl -X POST http://localhost:8080/sample \\\n    \
         -d '{{\"numberOfSamples\": 10, \"timeInterval\": \"10ms\"}}'\n\n\
         Or grab a pprof profile:\n\n  \
         curl 'http://localhost:8080/debug/pprof/profile?seconds=5&rate=100' -o profile.pb.gz\n",
        request.method,
        request.path_segments.join("/"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_slug_is_served() {
        let mut router = Router::new();
        router.register(&["hello"], |_req| Some(RouteResponse::ok_text("world")));

        let response = router.handle(&RouteRequest::new("GET", "/hello"));
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"world");
    }

    #[test]
    fn handlers_are_tried_in_registration_order_until_one_claims() {
        let mut router = Router::new();
        router.register(&["clash", "on", "this", "slug"], |_req| None);
        router.register(&["clash", "on", "this", "slug"], |_req| {
            Some(RouteResponse::ok_text("hi"))
        });

        let response = router.handle(&RouteRequest::new("GET", "/clash/on/this/slug"));
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"hi");
    }

    #[test]
    fn first_claiming_handler_wins() {
        let mut router = Router::new();
        router.register(&["x"], |_req| Some(RouteResponse::ok_text("first")));
        router.register(&["x"], |_req| Some(RouteResponse::ok_text("second")));

        let response = router.handle(&RouteRequest::new("GET", "/x"));
        assert_eq!(response.body, b"first");
    }

    #[test]
    fn unmatched_path_is_a_404_with_a_curl_example() {
        let router = Router::new();
        let response = router.handle(&RouteRequest::new("GET", "/nope"));
        assert_eq!(response.status, 404);
        let body = String::from_utf8(response.body).unwrap();
        assert!(body.contains("curl"));
        assert!(body.contains("GET /nope"));
    }

    #[test]
    fn query_strings_parse_into_a_map() {
        let request = RouteRequest::new("GET", "/debug/pprof/profile?seconds=5&rate=100");
        assert_eq!(
            request.path_segments,
            vec!["debug", "pprof", "profile"]
        );
        assert_eq!(request.query.get("seconds").map(String::as_str), Some("5"));
        assert_eq!(request.query.get("rate").map(String::as_str), Some("100"));
    }
}
