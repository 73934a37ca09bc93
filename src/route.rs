//! Path-segment trie mapping (method, path) to a handler (spec.md §4.4).
use crate::protocol::{HttpMethod, NUM_HTTP_METHODS};
use crate::request::Request;
use crate::response::Response;
use std::collections::HashMap;

/// A handler is a function from an owned `Request` to an optional
/// `Response`. `None` is equivalent to `Response::empty(204)` — applied by
/// the dispatcher, not the handler author (spec.md §6).
pub type Handler = fn(Request) -> Option<Response>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SegmentKind {
    Constant,
    Param,
}

struct RouteNode {
    #[allow(dead_code)]
    kind: SegmentKind,
    /// Constant-segment children, keyed by the raw path segment as received
    /// at registration time (including the `<...>` brackets for param
    /// segments — see `resolve`'s doc comment for why that makes param
    /// routes currently unreachable by design).
    const_children: HashMap<String, RouteNode>,
    /// Reserved for future parameterized-route dispatch. Never populated or
    /// consulted by `resolve` in this revision (spec.md §4.4, §9).
    #[allow(dead_code)]
    var_children: HashMap<String, RouteNode>,
    handlers: Option<Box<[Option<Handler>; NUM_HTTP_METHODS]>>,
}

impl RouteNode {
    fn new(kind: SegmentKind) -> Self {
        Self {
            kind,
            const_children: HashMap::new(),
            var_children: HashMap::new(),
            handlers: None,
        }
    }
}

fn segment_kind(segment: &str) -> SegmentKind {
    if segment.len() >= 2 && segment.starts_with('<') && segment.ends_with('>') {
        SegmentKind::Param
    } else {
        SegmentKind::Constant
    }
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

pub struct RouteTrie {
    root: RouteNode,
}

/// Outcome of a lookup. The three error variants correspond exactly to the
/// canonical-error constructors in `Response` (spec.md §4.3/§4.4) — the
/// event loop maps them 1:1 rather than the trie constructing `Response`s
/// itself, keeping this module free of response-formatting concerns.
pub enum RouteOutcome {
    Handler(Handler),
    NotFound,
    MethodNotAllowed,
    /// `method` was `HttpMethod::Unknown` (spec.md §4.4: "If method = UNKNOWN,
    /// return malformed_request").
    Malformed,
}

impl RouteTrie {
    pub fn new() -> Self {
        Self { root: RouteNode::new(SegmentKind::Constant) }
    }

    /// Registers `handler` at `(method, path)`. Misuse (`method ==
    /// HttpMethod::Unknown`) is fatal — a programming error, not a runtime
    /// condition the client can trigger (spec.md §4.4, §7).
    pub fn register(&mut self, method: HttpMethod, path: &str, handler: Handler) {
        assert!(
            method != HttpMethod::Unknown,
            "cannot register a handler for HttpMethod::Unknown"
        );

        let mut node = &mut self.root;
        for segment in split_path(path) {
            let kind = segment_kind(segment);
            node = node
                .const_children
                .entry(segment.to_string())
                .or_insert_with(|| RouteNode::new(kind));
        }

        let table = node
            .handlers
            .get_or_insert_with(|| Box::new([None; NUM_HTTP_METHODS]));
        let idx = method.table_index().expect("checked above");
        if table[idx].is_some() {
            eprintln!("[warn] redefinition of route '{} {}'", method.as_str(), path);
        }
        table[idx] = Some(handler);
    }

    /// Walks segments through constant children only; a missing segment at
    /// any depth is `NotFound`, a terminal node with no handler table is
    /// `NotFound`, and a terminal node whose method slot is empty is
    /// `MethodNotAllowed` (the existing-path / absent-method distinction
    /// spec.md §9 calls out as the invariant a rearchitect must preserve).
    pub fn resolve(&self, method: HttpMethod, path: &str) -> RouteOutcome {
        if method == HttpMethod::Unknown {
            return RouteOutcome::Malformed;
        }

        let mut node = &self.root;
        for segment in split_path(path) {
            match node.const_children.get(segment) {
                Some(child) => node = child,
                None => return RouteOutcome::NotFound,
            }
        }

        match &node.handlers {
            None => RouteOutcome::NotFound,
            Some(table) => {
                let idx = method.table_index().expect("checked above");
                match table[idx] {
                    Some(h) => RouteOutcome::Handler(h),
                    None => RouteOutcome::MethodNotAllowed,
                }
            }
        }
    }
}

impl Default for RouteTrie {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HttpStatus;

    fn ok_handler(_req: Request) -> Option<Response> {
        Some(Response::from_string(HttpStatus::Ok, "{\"r\":1}"))
    }

    #[test]
    fn get_and_post_on_same_path_dispatch_independently() {
        let mut trie = RouteTrie::new();
        trie.register(HttpMethod::Get, "/v1/api/test", ok_handler);
        trie.register(HttpMethod::Post, "/v1/api/test", ok_handler);

        assert!(matches!(
            trie.resolve(HttpMethod::Get, "/v1/api/test"),
            RouteOutcome::Handler(_)
        ));
        assert!(matches!(
            trie.resolve(HttpMethod::Post, "/v1/api/test"),
            RouteOutcome::Handler(_)
        ));
        assert!(matches!(
            trie.resolve(HttpMethod::Put, "/v1/api/test"),
            RouteOutcome::MethodNotAllowed
        ));
    }

    #[test]
    fn missing_path_is_not_found_not_method_not_allowed() {
        let mut trie = RouteTrie::new();
        trie.register(HttpMethod::Get, "/v1/api/test", ok_handler);
        assert!(matches!(trie.resolve(HttpMethod::Get, "/nope"), RouteOutcome::NotFound));
    }

    #[test]
    fn unknown_method_is_malformed_regardless_of_route_table() {
        let trie = RouteTrie::new();
        assert!(matches!(
            trie.resolve(HttpMethod::Unknown, "/anything"),
            RouteOutcome::Malformed
        ));
    }

    #[test]
    fn param_segments_are_unreachable_in_this_revision() {
        let mut trie = RouteTrie::new();
        trie.register(HttpMethod::Get, "/users/<id>", ok_handler);
        assert!(matches!(
            trie.resolve(HttpMethod::Get, "/users/123"),
            RouteOutcome::NotFound
        ));
    }

    #[test]
    #[should_panic(expected = "HttpMethod::Unknown")]
    fn registering_unknown_method_panics() {
        let mut trie = RouteTrie::new();
        trie.register(HttpMethod::Unknown, "/x", ok_handler);
    }

    #[test]
    fn redefinition_replaces_prior_handler() {
        fn other_handler(_req: Request) -> Option<Response> {
            Some(Response::empty(HttpStatus::NoContent))
        }
        let mut trie = RouteTrie::new();
        trie.register(HttpMethod::Get, "/x", ok_handler);
        trie.register(HttpMethod::Get, "/x", other_handler);
        match trie.resolve(HttpMethod::Get, "/x") {
            RouteOutcome::Handler(h) => {
                let resp = h(Request::new(HttpMethod::Get)).unwrap();
                assert_eq!(resp.status, HttpStatus::NoContent);
            }
            _ => panic!("expected handler"),
        }
    }
}
