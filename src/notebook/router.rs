//! Path pattern with `:name` parameters turned into a parameterised regex,
//! with tie-break order by specificity.
//!
//! Every `:name` segment becomes a named regex capture group; route
//! precedence is decided up front by
//! [`crate::notebook::cellparser::collect_endpoints`], so the router here
//! only needs to try patterns in the order it was given them.

use std::collections::BTreeMap;

use regex::Regex;

use crate::notebook::cellparser::HttpVerb;

/// One route: a compiled path pattern plus the source bound to each verb.
pub struct Route {
    path_template: String,
    pattern: Regex,
    handlers: BTreeMap<HttpVerb, String>,
}

/// The full set of routes built from a parsed seed notebook, tried in
/// descending specificity order (most specific pattern first).
pub struct EndpointRouter {
    routes: Vec<Route>,
}

/// The outcome of routing a request path.
pub enum Matched<'a> {
    /// The path matched a route and the verb has a bound cell.
    Found {
        source: &'a str,
        path_params: BTreeMap<String, String>,
    },
    /// The path matched a route but the verb has no bound cell.
    MethodNotAllowed,
    /// No route's pattern matched the path at all.
    NotFound,
}

impl EndpointRouter {
    /// Build a router from the ordered endpoint table ([`collect_endpoints`]
    /// already sorts most-specific-first).
    ///
    /// [`collect_endpoints`]: crate::notebook::cellparser::collect_endpoints
    pub fn build(endpoints: Vec<(String, BTreeMap<HttpVerb, String>)>) -> Self {
        let routes = endpoints
            .into_iter()
            .map(|(path_template, handlers)| Route {
                pattern: parameterize(&path_template),
                path_template,
                handlers,
            })
            .collect();
        Self { routes }
    }

    /// Match a request path and verb against the route table.
    pub fn route(&self, verb: HttpVerb, path: &str) -> Matched<'_> {
        let mut path_matched_any_verb = false;
        for route in &self.routes {
            let Some(captures) = route.pattern.captures(path) else {
                continue;
            };
            path_matched_any_verb = true;
            if let Some(source) = route.handlers.get(&verb) {
                let path_params = route
                    .pattern
                    .capture_names()
                    .flatten()
                    .filter_map(|name| {
                        captures
                            .name(name)
                            .map(|value| (name.to_string(), value.as_str().to_string()))
                    })
                    .collect();
                return Matched::Found { source, path_params };
            }
        }
        if path_matched_any_verb {
            Matched::MethodNotAllowed
        } else {
            Matched::NotFound
        }
    }

    /// Every distinct path template registered, for Swagger generation.
    pub fn path_templates(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.path_template.as_str())
    }
}

fn parameterize(path: &str) -> Regex {
    let mut pattern = String::from("^");
    for segment in path.split('/') {
        if segment.is_empty() {
            continue;
        }
        pattern.push('/');
        if let Some(name) = segment.strip_prefix(':') {
            pattern.push_str(&format!("(?P<{name}>[^/]+)"));
        } else {
            pattern.push_str(&regex::escape(segment));
        }
    }
    if pattern == "^" {
        pattern.push('/');
    }
    pattern.push('$');
    Regex::new(&pattern).expect("parameterized path pattern is well-formed")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handlers(source: &str) -> BTreeMap<HttpVerb, String> {
        let mut m = BTreeMap::new();
        m.insert(HttpVerb::Get, source.to_string());
        m
    }

    #[test]
    fn matches_literal_path() {
        let router = EndpointRouter::build(vec![("/hello".to_string(), handlers("a"))]);
        assert!(matches!(router.route(HttpVerb::Get, "/hello"), Matched::Found { .. }));
        assert!(matches!(router.route(HttpVerb::Get, "/nope"), Matched::NotFound));
    }

    #[test]
    fn extracts_named_path_params() {
        let router =
            EndpointRouter::build(vec![("/hello/:name".to_string(), handlers("a"))]);
        match router.route(HttpVerb::Get, "/hello/world") {
            Matched::Found { path_params, .. } => {
                assert_eq!(path_params.get("name"), Some(&"world".to_string()));
            }
            _ => panic!("expected a match"),
        }
    }

    #[test]
    fn prefers_more_specific_route_when_given_first() {
        let routes = vec![
            ("/hello/world".to_string(), handlers("specific")),
            ("/hello/:name".to_string(), handlers("generic")),
        ];
        let router = EndpointRouter::build(routes);
        match router.route(HttpVerb::Get, "/hello/world") {
            Matched::Found { source, .. } => assert_eq!(source, "specific"),
            _ => panic!("expected a match"),
        }
    }

    #[test]
    fn method_not_allowed_when_path_matches_but_verb_does_not() {
        let mut handlers = BTreeMap::new();
        handlers.insert(HttpVerb::Post, "a".to_string());
        let router = EndpointRouter::build(vec![("/hello".to_string(), handlers)]);
        assert!(matches!(
            router.route(HttpVerb::Get, "/hello"),
            Matched::MethodNotAllowed
        ));
    }
}
