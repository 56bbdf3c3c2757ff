//! Route table: endpoint patterns and handler lookup.
//!
//! Patterns are exact endpoint paths, optionally with `{name}` segment
//! wildcards and a trailing `**`. More specific patterns outrank less
//! specific ones; ties go to registration order.

use super::{BoxHandler, ServerError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    /// Trailing `**`, matches the rest of the endpoint (possibly empty).
    Rest,
}

/// One registered route.
#[derive(Clone)]
pub struct Route {
    pub pattern: String,
    segments: Vec<Segment>,
    pub handler: BoxHandler,
    order: usize,
}

impl Route {
    fn parse(pattern: &str, handler: BoxHandler, order: usize) -> Result<Self, ServerError> {
        let raw: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
        if raw.is_empty() {
            return Err(ServerError::InvalidRoute(format!(
                "empty route pattern {pattern:?}"
            )));
        }

        let mut segments = Vec::with_capacity(raw.len());
        for (i, part) in raw.iter().enumerate() {
            if *part == "**" {
                if i != raw.len() - 1 {
                    return Err(ServerError::InvalidRoute(format!(
                        "`**` is only allowed as the final segment: {pattern:?}"
                    )));
                }
                segments.push(Segment::Rest);
            } else if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                segments.push(Segment::Param(name.to_string()));
            } else if part.contains(['{', '}', '*']) {
                return Err(ServerError::InvalidRoute(format!(
                    "bad segment {part:?} in {pattern:?}"
                )));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }

        Ok(Self {
            pattern: pattern.to_string(),
            segments,
            handler,
            order,
        })
    }

    fn matches(&self, endpoint: &[&str]) -> bool {
        let mut i = 0;
        for segment in &self.segments {
            match segment {
                Segment::Rest => return true,
                Segment::Literal(lit) => {
                    if endpoint.get(i) != Some(&lit.as_str()) {
                        return false;
                    }
                }
                Segment::Param(_) => {
                    if endpoint.get(i).is_none() {
                        return false;
                    }
                }
            }
            i += 1;
        }
        i == endpoint.len()
    }

    /// Higher compares greater for more specific routes: more literal
    /// segments first, then fewer wildcards, then no trailing rest.
    fn specificity(&self) -> (usize, usize, bool) {
        let literals = self
            .segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count();
        let named = self
            .segments
            .iter()
            .filter(|s| matches!(s, Segment::Param(_)))
            .count();
        let no_rest = !self.segments.iter().any(|s| matches!(s, Segment::Rest));
        (literals, named, no_rest)
    }
}

/// Registered routes of one event server.
#[derive(Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, pattern: &str, handler: BoxHandler) -> Result<(), ServerError> {
        let order = self.routes.len();
        let route = Route::parse(pattern, handler, order)?;
        self.routes.push(route);
        Ok(())
    }

    /// Find the best route for an endpoint path like `http/forward`.
    pub fn match_endpoint(&self, endpoint: &str) -> Option<&Route> {
        let segments: Vec<&str> = endpoint.split('/').filter(|s| !s.is_empty()).collect();
        self.routes
            .iter()
            .filter(|r| r.matches(&segments))
            .max_by(|a, b| {
                a.specificity()
                    .cmp(&b.specificity())
                    // Earlier registration wins ties.
                    .then(b.order.cmp(&a.order))
            })
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.pattern.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// True when a file name is a dispatchable request file: the `.request`
/// suffix, excluding rejection markers and in-flight temp files.
pub fn is_request_file_name(name: &str) -> bool {
    name.ends_with(crate::protocol::REQUEST_SUFFIX)
        && !name.ends_with(crate::protocol::REJECTED_SUFFIX)
        && !name.starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::HandlerResponse;
    use std::sync::Arc;

    fn noop() -> BoxHandler {
        Arc::new(|_req| Box::pin(async { Ok(HandlerResponse::default()) }))
    }

    fn table(patterns: &[&str]) -> RouteTable {
        let mut table = RouteTable::new();
        for p in patterns {
            table.register(p, noop()).unwrap();
        }
        table
    }

    #[test]
    fn test_exact_match() {
        let table = table(&["/ping"]);
        assert!(table.match_endpoint("ping").is_some());
        assert!(table.match_endpoint("pong").is_none());
        assert!(table.match_endpoint("ping/extra").is_none());
    }

    #[test]
    fn test_param_segment() {
        let table = table(&["/rooms/{room}/post"]);
        assert!(table.match_endpoint("rooms/general/post").is_some());
        assert!(table.match_endpoint("rooms/post").is_none());
        assert!(table.match_endpoint("rooms/general/other").is_none());
    }

    #[test]
    fn test_rest_suffix() {
        let table = table(&["/http/**"]);
        assert!(table.match_endpoint("http").is_some());
        assert!(table.match_endpoint("http/forward").is_some());
        assert!(table.match_endpoint("http/a/b/c").is_some());
        assert!(table.match_endpoint("other").is_none());
    }

    #[test]
    fn test_specificity_ranking() {
        let table = table(&["/api/**", "/api/{version}/status", "/api/v1/status"]);
        let best = table.match_endpoint("api/v1/status").unwrap();
        assert_eq!(best.pattern, "/api/v1/status");
        let best = table.match_endpoint("api/v2/status").unwrap();
        assert_eq!(best.pattern, "/api/{version}/status");
        let best = table.match_endpoint("api/v1/other").unwrap();
        assert_eq!(best.pattern, "/api/**");
    }

    #[test]
    fn test_tie_breaks_by_registration_order() {
        let table = table(&["/a/{x}", "/{y}/b"]);
        let best = table.match_endpoint("a/b").unwrap();
        assert_eq!(best.pattern, "/a/{x}");
    }

    #[test]
    fn test_invalid_patterns_rejected() {
        let mut table = RouteTable::new();
        assert!(table.register("", noop()).is_err());
        assert!(table.register("/a/**/b", noop()).is_err());
        assert!(table.register("/a/*.request", noop()).is_err());
    }

    #[test]
    fn test_is_request_file_name() {
        assert!(is_request_file_name("abc.request"));
        assert!(!is_request_file_name("abc.response"));
        assert!(!is_request_file_name("abc.syftrejected.request"));
        assert!(!is_request_file_name(".abc.request.tmp"));
        assert!(!is_request_file_name(".hidden.request"));
    }
}
