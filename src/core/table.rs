//! Routing-table assembly.
//!
//! [`build_snapshot`] fuses the container inventory and the raw config
//! tree into a published-ready snapshot. It is a total function: a
//! malformed leaf never fails the build, it is logged and dropped at the
//! smallest possible scope (single rule, or a whole destination when the
//! referenced container is unknown). A completely broken tree still
//! yields a valid, possibly empty, snapshot.
use std::{collections::HashMap, sync::Arc};

use regex::Regex;

use crate::core::route::{Account, Container, Route, RouteList};

/// Destination keys with this suffix name a container instead of a
/// literal host.
pub const CONTAINER_SUFFIX: &str = ".container";

/// The full routing table at one point in time. Immutable once built;
/// the registry only ever replaces it wholesale.
pub type Snapshot = HashMap<String, Arc<Account>>;

/// Raw config tree as read from the store, before any validation.
///
/// Mirrors the store's key hierarchy:
/// `<root>/<account>/<destination>/<priority>.<rule-name> -> <pattern>`.
/// Node order is the store's traversal order and is treated as
/// unspecified but stable for a given fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTree {
    pub accounts: Vec<AccountNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountNode {
    /// Last path segment of the account key.
    pub name: String,
    pub destinations: Vec<DestinationNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationNode {
    /// Last path segment: a literal host or `<name>.container`.
    pub key: String,
    pub rules: Vec<RuleLeaf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleLeaf {
    /// Last path segment: `<priority>.<rule-name>`, or a bare rule name
    /// (priority defaults to 0).
    pub key: String,
    /// Regex source.
    pub pattern: String,
}

/// Split a rule leaf key into `(priority, rule_name)`.
///
/// The key splits on the first `.`; without one, the whole key is the
/// rule name at priority 0. A priority that does not parse as an integer
/// is reported as an error and the leaf is skipped by the caller.
fn parse_rule_key(key: &str) -> Result<(i64, &str), std::num::ParseIntError> {
    match key.split_once('.') {
        Some((priority, name)) => Ok((priority.parse()?, name)),
        None => Ok((0, key)),
    }
}

/// Build a snapshot from the container inventory and the config tree.
///
/// `containers` is `None` when the container runtime is not configured;
/// every `.container` destination is then skipped with a diagnostic.
pub fn build_snapshot(
    containers: Option<&HashMap<String, Container>>,
    tree: &RouteTree,
) -> Snapshot {
    let mut snapshot = Snapshot::with_capacity(tree.accounts.len());

    for account_node in &tree.accounts {
        let mut routes = Vec::new();

        for destination in &account_node.destinations {
            let host = match destination.key.strip_suffix(CONTAINER_SUFFIX) {
                Some("") => {
                    // A bare ".container" key names nothing; treat it as
                    // a literal host like the store handed it to us.
                    destination.key.clone()
                }
                Some(container_name) => {
                    let Some(containers) = containers else {
                        tracing::warn!(
                            account = %account_node.name,
                            container = container_name,
                            "container runtime not available, skipping destination"
                        );
                        continue;
                    };
                    match containers.get(container_name) {
                        Some(container) => container.ip.clone(),
                        None => {
                            tracing::warn!(
                                account = %account_node.name,
                                container = container_name,
                                "container not found, skipping destination"
                            );
                            continue;
                        }
                    }
                }
                None => destination.key.clone(),
            };

            for leaf in &destination.rules {
                let (priority, rule_name) = match parse_rule_key(&leaf.key) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        tracing::warn!(
                            account = %account_node.name,
                            destination = %host,
                            rule = %leaf.key,
                            pattern = %leaf.pattern,
                            error = %e,
                            "invalid priority, skipping rule"
                        );
                        continue;
                    }
                };

                let pattern = match Regex::new(&leaf.pattern) {
                    Ok(re) => re,
                    Err(e) => {
                        tracing::warn!(
                            account = %account_node.name,
                            destination = %host,
                            pattern = %leaf.pattern,
                            priority,
                            error = %e,
                            "invalid pattern, skipping rule"
                        );
                        continue;
                    }
                };

                routes.push(Route {
                    name: rule_name.to_string(),
                    priority,
                    host: host.clone(),
                    pattern,
                });
            }
        }

        let account = Account {
            name: account_node.name.clone(),
            routes: RouteList::new(routes),
        };
        tracing::debug!(
            account = %account.name,
            routes = account.routes.len(),
            "assembled account"
        );
        snapshot.insert(account_node.name.clone(), Arc::new(account));
    }

    snapshot
}
