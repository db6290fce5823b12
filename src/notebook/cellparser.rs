//! Classifies notebook cells into endpoint cells, response-metadata cells,
//! and plain seed cells, and extracts their (verb, path) (C7).
//!
//! The first line of a cell is matched against `<prefix> <VERB> <PATH>` or
//! `<prefix> ResponseInfo <VERB> <PATH>`, where `<prefix>` is a
//! kernel-language-dependent comment token (`#` for most languages, `//`
//! for the JVM family).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

/// An HTTP verb a notebook endpoint cell can bind to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HttpVerb {
    Get,
    Put,
    Post,
    Delete,
}

impl FromStr for HttpVerb {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(HttpVerb::Get),
            "PUT" => Ok(HttpVerb::Put),
            "POST" => Ok(HttpVerb::Post),
            "DELETE" => Ok(HttpVerb::Delete),
            _ => Err(()),
        }
    }
}

impl fmt::Display for HttpVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HttpVerb::Get => "GET",
            HttpVerb::Put => "PUT",
            HttpVerb::Post => "POST",
            HttpVerb::Delete => "DELETE",
        })
    }
}

/// How a single cell was classified.
#[derive(Clone, Debug)]
pub enum CellKind {
    /// An endpoint cell bound to `(verb, path)`.
    Endpoint { verb: HttpVerb, path: String },
    /// A response-metadata cell for `(verb, path)`.
    ResponseMetadata { verb: HttpVerb, path: String },
    /// Neither of the above: executed once at seed time, in notebook order.
    Seed,
}

/// One code cell from the seed notebook, classified.
#[derive(Clone, Debug)]
pub struct Cell {
    pub source: String,
    pub kind: CellKind,
}

/// The comment token that prefixes endpoint indicator comments for a given
/// kernel language.
pub fn comment_prefix(kernel_language: &str) -> &'static str {
    match kernel_language {
        "scala" => "//",
        _ => "#",
    }
}

static HASH_INDICATOR: Lazy<Regex> = Lazy::new(|| compile_indicator("#"));
static HASH_RESPONSE_INDICATOR: Lazy<Regex> = Lazy::new(|| compile_response_indicator("#"));
static SLASH_INDICATOR: Lazy<Regex> = Lazy::new(|| compile_indicator("//"));
static SLASH_RESPONSE_INDICATOR: Lazy<Regex> = Lazy::new(|| compile_response_indicator("//"));

fn compile_indicator(prefix: &str) -> Regex {
    Regex::new(&format!(
        r"^{}\s+(GET|PUT|POST|DELETE)\s+(/\S*)",
        regex::escape(prefix)
    ))
    .expect("indicator regex is well-formed")
}

fn compile_response_indicator(prefix: &str) -> Regex {
    Regex::new(&format!(
        r"^{}\s+ResponseInfo\s+(GET|PUT|POST|DELETE)\s+(/\S*)",
        regex::escape(prefix)
    ))
    .expect("response indicator regex is well-formed")
}

fn regexes_for(prefix: &str) -> (&'static Regex, &'static Regex) {
    match prefix {
        "//" => (&SLASH_INDICATOR, &SLASH_RESPONSE_INDICATOR),
        _ => (&HASH_INDICATOR, &HASH_RESPONSE_INDICATOR),
    }
}

/// Classify a single cell's source given the kernel's comment prefix.
pub fn classify(source: &str, prefix: &str) -> CellKind {
    let first_line = source.lines().next().unwrap_or("");
    let (indicator, response_indicator) = regexes_for(prefix);

    if let Some(captures) = response_indicator.captures(first_line) {
        let verb = captures[1].parse().expect("regex only matches known verbs");
        return CellKind::ResponseMetadata {
            verb,
            path: captures[2].trim().to_string(),
        };
    }
    if let Some(captures) = indicator.captures(first_line) {
        let verb = captures[1].parse().expect("regex only matches known verbs");
        return CellKind::Endpoint {
            verb,
            path: captures[2].trim().to_string(),
        };
    }
    CellKind::Seed
}

/// Parse every code cell of a seed notebook into classified [`Cell`]s.
pub fn parse_cells(sources: impl IntoIterator<Item = String>, kernel_language: &str) -> Vec<Cell> {
    let prefix = comment_prefix(kernel_language);
    sources
        .into_iter()
        .map(|source| {
            let kind = classify(&source, prefix);
            Cell { source, kind }
        })
        .collect()
}

/// Index of the first `:`-parameter path segment, counted from the root, or
/// `usize::MAX` if the path has no parameter segment. Used to rank route
/// patterns: the larger the index, the more specific the match.
pub fn first_path_param_index(path: &str) -> usize {
    match path.find(':') {
        None => usize::MAX,
        Some(colon_idx) => path[..colon_idx].matches('/').count().saturating_sub(1),
    }
}

/// Concatenate every endpoint cell with the same `(path, verb)`, in
/// notebook order, each body followed by a newline. Returns entries sorted
/// descending by specificity so the most specific path pattern is tried
/// first.
pub fn collect_endpoints(cells: &[Cell]) -> Vec<(String, BTreeMap<HttpVerb, String>)> {
    let mut endpoints: BTreeMap<String, BTreeMap<HttpVerb, String>> = BTreeMap::new();
    let mut definition_order: BTreeMap<String, usize> = BTreeMap::new();
    for cell in cells {
        if let CellKind::Endpoint { verb, path } = &cell.kind {
            let next_index = definition_order.len();
            definition_order.entry(path.clone()).or_insert(next_index);
            let entry = endpoints.entry(path.clone()).or_default();
            let source = entry.entry(*verb).or_default();
            source.push_str(&cell.source);
            source.push('\n');
        }
    }
    let mut entries: Vec<_> = endpoints.into_iter().collect();
    entries.sort_by(|(a, _), (b, _)| {
        first_path_param_index(b)
            .cmp(&first_path_param_index(a))
            .then_with(|| definition_order[a].cmp(&definition_order[b]))
    });
    entries
}

/// Concatenate every response-metadata cell with the same `(path, verb)`.
pub fn collect_response_metadata(cells: &[Cell]) -> BTreeMap<(String, HttpVerb), String> {
    let mut metadata: BTreeMap<(String, HttpVerb), String> = BTreeMap::new();
    for cell in cells {
        if let CellKind::ResponseMetadata { verb, path } = &cell.kind {
            let source = metadata.entry((path.clone(), *verb)).or_default();
            source.push_str(&cell.source);
            source.push('\n');
        }
    }
    metadata
}

/// A fully parsed seed notebook: classified cells plus the kernel language
/// and kernelspec name the seeding gate compares against.
#[derive(Clone, Debug)]
pub struct ParsedNotebook {
    pub cells: Vec<Cell>,
    pub kernelspec_name: String,
    pub kernel_language: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_endpoint_cell() {
        let kind = classify("# GET /hello/:name\nprint('hi')", "#");
        assert!(matches!(kind, CellKind::Endpoint { verb: HttpVerb::Get, ref path } if path == "/hello/:name"));
    }

    #[test]
    fn classifies_response_metadata_cell() {
        let kind = classify("# ResponseInfo POST /hello\nprint('{}')", "#");
        assert!(matches!(
            kind,
            CellKind::ResponseMetadata { verb: HttpVerb::Post, ref path } if path == "/hello"
        ));
    }

    #[test]
    fn classifies_plain_cell_as_seed() {
        let kind = classify("import pandas as pd", "#");
        assert!(matches!(kind, CellKind::Seed));
    }

    #[test]
    fn scala_uses_double_slash_prefix() {
        let kind = classify("// GET /status", "scala");
        assert!(matches!(kind, CellKind::Endpoint { verb: HttpVerb::Get, .. }));
    }

    #[test]
    fn first_path_param_index_matches_reference_examples() {
        assert_eq!(first_path_param_index("/foo/:bar"), 1);
        assert_eq!(first_path_param_index("/foo/quo/:bar"), 2);
        assert_eq!(first_path_param_index("/foo/quo/bar"), usize::MAX);
    }

    #[test]
    fn collect_endpoints_orders_most_specific_first() {
        let cells = parse_cells(
            vec![
                "# GET /:foo\nprint(1)".to_string(),
                "# GET /hello/world\nprint(2)".to_string(),
                "# GET /hello/:foo\nprint(3)".to_string(),
            ],
            "python",
        );
        let endpoints = collect_endpoints(&cells);
        let paths: Vec<&str> = endpoints.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["/hello/world", "/hello/:foo", "/:foo"]);
    }

    #[test]
    fn collect_endpoints_breaks_specificity_ties_by_definition_order() {
        let cells = parse_cells(
            vec![
                "# GET /z/:id\nprint(1)".to_string(),
                "# GET /a/:id\nprint(2)".to_string(),
            ],
            "python",
        );
        let endpoints = collect_endpoints(&cells);
        let paths: Vec<&str> = endpoints.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["/z/:id", "/a/:id"]);
    }

    #[test]
    fn collect_endpoints_concatenates_same_path_and_verb() {
        let cells = parse_cells(
            vec![
                "# GET /hello\nprint(1)".to_string(),
                "# GET /hello\nprint(2)".to_string(),
            ],
            "python",
        );
        let endpoints = collect_endpoints(&cells);
        assert_eq!(endpoints.len(), 1);
        let source = &endpoints[0].1[&HttpVerb::Get];
        assert!(source.contains("print(1)"));
        assert!(source.contains("print(2)"));
        assert!(source.find("print(1)").unwrap() < source.find("print(2)").unwrap());
    }
}
