//! Route model and host matching.
//!
//! A [`RouteList`] is an ordered set of compiled rewrite rules. Matching is
//! a linear first-match scan over patterns sorted by priority (highest
//! first), against the name portion of a `host[:port]` string only; the
//! port suffix is carried over verbatim.
//!
//! Everything here is immutable after construction and safe to share
//! across request tasks without synchronization.
use std::fmt;

use regex::Regex;

/// A running container as reported by the container runtime.
///
/// The same value is registered under every alias the runtime knows the
/// container by (its canonical name and its linked names).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    /// Canonical container name, leading slash stripped.
    pub name: String,
    /// Address in dotted-quad form, e.g. `172.17.0.2`.
    pub ip: String,
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.ip)
    }
}

/// One rewrite rule: hosts matching `pattern` are redirected to `host`.
///
/// `name` is free-form operator metadata carried through from the config
/// store leaf; it only ever shows up in diagnostics.
#[derive(Debug, Clone)]
pub struct Route {
    pub name: String,
    pub priority: i64,
    pub host: String,
    pub pattern: Regex,
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pr:{} -> {}", self.pattern, self.priority, self.host)
    }
}

/// Routes sorted by priority descending, ties in discovery order.
///
/// Constructed by the table builder; the sort invariant holds from the
/// moment a list becomes visible to readers.
#[derive(Debug, Clone, Default)]
pub struct RouteList(Vec<Route>);

impl RouteList {
    /// Build a list from already-assembled routes, establishing the sort
    /// invariant. The sort is stable so equal priorities keep the order
    /// the routes were discovered in.
    pub fn new(mut routes: Vec<Route>) -> Self {
        routes.sort_by_key(|r| std::cmp::Reverse(r.priority));
        Self(routes)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Route> {
        self.0.iter()
    }

    /// Rewrite `host` according to the first matching route.
    ///
    /// `host` may carry a `:port` suffix; only the name portion is
    /// matched and the suffix is preserved bit for bit. When nothing
    /// matches the input is returned unchanged.
    pub fn replace(&self, host: &str) -> String {
        let (name, port) = match host.split_once(':') {
            Some((name, port)) if !port.is_empty() => (name, Some(port)),
            Some((name, _)) => (name, None),
            None => (host, None),
        };

        for route in &self.0 {
            if route.pattern.is_match(name) {
                return match port {
                    Some(port) => format!("{}:{}", route.host, port),
                    None => route.host.clone(),
                };
            }
        }

        host.to_string()
    }
}

/// A named bundle of routing rules; maps 1:1 to a proxy user.
#[derive(Debug, Clone, Default)]
pub struct Account {
    pub name: String,
    pub routes: RouteList,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(priority: i64, pattern: &str, host: &str) -> Route {
        Route {
            name: format!("r{priority}"),
            priority,
            host: host.to_string(),
            pattern: Regex::new(pattern).unwrap(),
        }
    }

    #[test]
    fn replace_rewrites_first_match() {
        let routes = RouteList::new(vec![route(0, r"^.*\.svc\.com$", "10.0.0.5")]);
        assert_eq!(routes.replace("api.svc.com"), "10.0.0.5");
        assert_eq!(routes.replace("other.com"), "other.com");
    }

    #[test]
    fn replace_preserves_port_verbatim() {
        let routes = RouteList::new(vec![route(0, r"^.*\.svc\.com$", "10.0.0.5")]);
        assert_eq!(routes.replace("api.svc.com:8080"), "10.0.0.5:8080");
        assert_eq!(routes.replace("other.com:80"), "other.com:80");
    }

    #[test]
    fn replace_treats_empty_port_as_absent() {
        let routes = RouteList::new(vec![route(0, r"^db$", "172.17.0.9")]);
        assert_eq!(routes.replace("db:"), "172.17.0.9");
    }

    #[test]
    fn replace_matches_name_portion_only() {
        // The port must not leak into the match.
        let routes = RouteList::new(vec![route(0, r"^foo:80$", "1.2.3.4")]);
        assert_eq!(routes.replace("foo:80"), "foo:80");
    }

    #[test]
    fn higher_priority_wins() {
        let routes = RouteList::new(vec![
            route(0, r".*", "1.1.1.1"),
            route(5, r"^foo\..*", "2.2.2.2"),
        ]);
        assert_eq!(routes.replace("foo.bar"), "2.2.2.2");
        assert_eq!(routes.replace("baz.qux"), "1.1.1.1");
    }

    #[test]
    fn equal_priority_keeps_discovery_order() {
        let routes = RouteList::new(vec![
            route(3, r"^a$", "first"),
            route(3, r"^a$", "second"),
        ]);
        assert_eq!(routes.replace("a"), "first");
    }

    #[test]
    fn empty_name_matches_only_permissive_patterns() {
        let routes = RouteList::new(vec![route(0, r"^x$", "1.1.1.1")]);
        assert_eq!(routes.replace(""), "");

        let routes = RouteList::new(vec![route(0, r".*", "2.2.2.2")]);
        assert_eq!(routes.replace(""), "2.2.2.2");
        assert_eq!(routes.replace(":9090"), "2.2.2.2:9090");
    }

    #[test]
    fn empty_list_is_identity() {
        let routes = RouteList::default();
        assert_eq!(routes.replace("anything:123"), "anything:123");
    }
}
