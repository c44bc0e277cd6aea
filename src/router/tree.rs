//! Prefix tree over path segments.
//!
//! The first level below the root is the method token (`GET`, `POST`,
//! `_INTERNAL`, ...); every further level is one path segment. Each node owns
//! its literal children by segment string plus at most one parameter child,
//! and optionally the [`RoutingEntry`] that terminates there.
//!
//! Parameter names are not part of the tree shape: `/users/{id}/posts` and
//! `/users/{user_id}/likes` share one parameter node, and each entry binds
//! its own names when it is selected.

use std::collections::HashMap;
use std::sync::Arc;

use super::RouteError;
use super::entry::RoutingEntry;

/// Longest supported pattern, in path segments. One metric bit per segment.
pub(crate) const MAX_SEGMENTS: usize = 64;

// A single pattern segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Segment {
    Literal(String),
    Param(String),
}

/// Splits a path into its non-empty segments. Trailing and doubled slashes
/// are ignored, so `/users/` and `/users` are the same path.
pub(crate) fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Compile a pattern such as `/users/{id}/posts` (or `/users/:id/posts`).
pub(crate) fn parse_pattern(pattern: &str) -> Result<Vec<Segment>, RouteError> {
    let invalid = |reason: &'static str| RouteError::InvalidPattern {
        pattern: pattern.to_owned(),
        reason,
    };

    if !pattern.starts_with('/') {
        return Err(invalid("pattern must start with '/'"));
    }

    let mut segments = Vec::new();
    for raw in split_path(pattern) {
        let segment = if let Some(inner) = raw.strip_prefix('{') {
            let name = inner
                .strip_suffix('}')
                .ok_or_else(|| invalid("unterminated '{' in segment"))?;
            Segment::Param(name.to_owned())
        } else if let Some(name) = raw.strip_prefix(':') {
            Segment::Param(name.to_owned())
        } else if raw.contains('{') || raw.contains('}') {
            return Err(invalid("braces are only allowed around a whole segment"));
        } else {
            Segment::Literal(raw.to_owned())
        };

        if let Segment::Param(name) = &segment {
            if name.is_empty() || name.contains(['{', '}', ':']) {
                return Err(invalid("invalid parameter name"));
            }
            if segments
                .iter()
                .any(|s| matches!(s, Segment::Param(n) if n == name))
            {
                return Err(invalid("duplicate parameter name"));
            }
        }
        segments.push(segment);
    }

    if segments.len() > MAX_SEGMENTS {
        return Err(invalid("too many segments"));
    }
    Ok(segments)
}

/// Specificity of a compiled pattern: bit `63 - i` is set when segment `i`
/// is a literal. Among patterns of equal length, the one whose first
/// differing segment is literal scores higher; a fully literal path beats
/// every parameterized path of the same length.
pub(crate) fn metrics(segments: &[Segment]) -> u64 {
    segments
        .iter()
        .enumerate()
        .filter(|(_, s)| matches!(s, Segment::Literal(_)))
        .fold(0, |acc, (i, _)| acc | (1u64 << (63 - i)))
}

#[derive(Default)]
pub(crate) struct RouteNode {
    literals: HashMap<String, RouteNode>,
    param: Option<Box<RouteNode>>,
    entry: Option<Arc<RoutingEntry>>,
}

impl RouteNode {
    /// Returns the entry already occupying the leaf for `method` + `segments`, if any.
    pub(crate) fn occupant(&self, method: &str, segments: &[Segment]) -> Option<&Arc<RoutingEntry>> {
        let mut node = self.literals.get(method)?;
        for segment in segments {
            node = match segment {
                Segment::Literal(s) => node.literals.get(s)?,
                Segment::Param(_) => node.param.as_deref()?,
            };
        }
        node.entry.as_ref()
    }

    /// Inserts `entry` at the leaf for `method` + `segments`, creating nodes
    /// on the way. Callers check [`occupant`](Self::occupant) first.
    pub(crate) fn insert(&mut self, method: &str, segments: &[Segment], entry: Arc<RoutingEntry>) {
        let mut node = self.literals.entry(method.to_owned()).or_default();
        for segment in segments {
            node = match segment {
                Segment::Literal(s) => node.literals.entry(s.clone()).or_default(),
                Segment::Param(_) => &mut **node.param.get_or_insert_with(Box::default),
            };
        }
        node.entry = Some(entry);
    }

    /// Collects every leaf matching `segments`. Literal children are visited
    /// before the parameter child.
    pub(crate) fn collect<'a>(&'a self, segments: &[&str], out: &mut Vec<&'a Arc<RoutingEntry>>) {
        let Some((head, rest)) = segments.split_first() else {
            if let Some(entry) = &self.entry {
                out.push(entry);
            }
            return;
        };

        if let Some(child) = self.literals.get(*head) {
            child.collect(rest, out);
        }
        if let Some(child) = &self.param {
            child.collect(rest, out);
        }
    }

    /// Number of nodes below and including this one.
    #[cfg(test)]
    pub(crate) fn node_count(&self) -> usize {
        1 + self.literals.values().map(RouteNode::node_count).sum::<usize>()
            + self.param.as_ref().map_or(0, |p| p.node_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(s: &str) -> Segment {
        Segment::Literal(s.to_owned())
    }

    fn param(s: &str) -> Segment {
        Segment::Param(s.to_owned())
    }

    #[test]
    fn parse_root() {
        assert_eq!(parse_pattern("/").unwrap(), vec![]);
    }

    #[test]
    fn parse_mixed_segments() {
        assert_eq!(
            parse_pattern("/users/{id}/posts/:post_id/").unwrap(),
            vec![lit("users"), param("id"), lit("posts"), param("post_id")]
        );
    }

    #[test]
    fn parse_rejects_malformed_patterns() {
        for bad in ["users", "/users/{id", "/users/{}", "/a/x{y}", "/a/{id}/b/{id}", "/a/:"] {
            assert!(
                matches!(parse_pattern(bad), Err(RouteError::InvalidPattern { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn parse_rejects_overlong_patterns() {
        let pattern = "/x".repeat(MAX_SEGMENTS + 1);
        assert!(parse_pattern(&pattern).is_err());
        assert!(parse_pattern(&"/x".repeat(MAX_SEGMENTS)).is_ok());
    }

    #[test]
    fn literal_beats_parameter_metric() {
        let literal = metrics(&parse_pattern("/a/b").unwrap());
        let param_last = metrics(&parse_pattern("/a/{x}").unwrap());
        let param_first = metrics(&parse_pattern("/{x}/b").unwrap());
        assert!(literal > param_last);
        assert!(param_last > param_first);
    }

    #[test]
    fn shared_param_node_for_different_names() {
        let mut root = RouteNode::default();
        let a = parse_pattern("/users/{id}/posts").unwrap();
        let b = parse_pattern("/users/{user_id}/likes").unwrap();
        assert!(root.occupant("GET", &a).is_none());

        // method + users + param + posts/likes
        let dummy = |identifier: &str| {
            Arc::new(RoutingEntry {
                identifier: identifier.to_owned(),
                method: crate::Method::Get,
                pattern: String::new(),
                params: Vec::new(),
                group: "default".to_owned(),
                controller: Arc::new(super::super::FunctionController),
                handler: Arc::new(|_| Ok(())),
                content_type: None,
                metrics: 0,
                sequence: 0,
            })
        };
        root.insert("GET", &a, dummy("a"));
        root.insert("GET", &b, dummy("b"));
        assert_eq!(root.node_count(), 1 + 5);

        let same_shape = parse_pattern("/users/{other}/posts").unwrap();
        assert_eq!(root.occupant("GET", &same_shape).unwrap().identifier(), "a");

        let mut out = Vec::new();
        root.collect(&["GET", "users", "7", "likes"], &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].identifier(), "b");
    }
}
