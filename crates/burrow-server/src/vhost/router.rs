//! Triple-keyed route index for virtual hosting.
//!
//! Keys are (domain, location prefix, http user).  Lookup order: exact
//! domain, then wildcard domains produced by replacing leading labels with
//! `*`, then the `*` catch-all; at every domain step the requested http
//! user is tried before the empty-user fallback, and the longest matching
//! location prefix wins.

use crate::error::{Result, ServerError};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

pub struct VhostRouters<P> {
    /// domain → http user → routes sorted by location length, longest first.
    index: RwLock<HashMap<String, HashMap<String, Vec<Entry<P>>>>>,
}

struct Entry<P> {
    location: String,
    payload: Arc<P>,
}

impl<P> VhostRouters<P> {
    pub fn new() -> Self {
        Self {
            index: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, domain: &str, location: &str, http_user: &str, payload: Arc<P>) -> Result<()> {
        let mut index = self.index.write().unwrap();
        let by_user = index.entry(domain.to_string()).or_default();
        let entries = by_user.entry(http_user.to_string()).or_default();
        if entries.iter().any(|e| e.location == location) {
            return Err(ServerError::RouteConflict {
                domain: domain.to_string(),
                location: location.to_string(),
            });
        }
        entries.push(Entry {
            location: location.to_string(),
            payload,
        });
        entries.sort_by(|a, b| b.location.len().cmp(&a.location.len()));
        Ok(())
    }

    pub fn remove(&self, domain: &str, location: &str, http_user: &str) {
        let mut index = self.index.write().unwrap();
        if let Some(by_user) = index.get_mut(domain) {
            if let Some(entries) = by_user.get_mut(http_user) {
                entries.retain(|e| e.location != location);
                if entries.is_empty() {
                    by_user.remove(http_user);
                }
            }
            if by_user.is_empty() {
                index.remove(domain);
            }
        }
    }

    /// Exact-key lookup, no fallbacks.
    pub fn get(&self, domain: &str, location: &str, http_user: &str) -> Option<Arc<P>> {
        let index = self.index.read().unwrap();
        index
            .get(domain)?
            .get(http_user)?
            .iter()
            .find(|e| e.location == location)
            .map(|e| Arc::clone(&e.payload))
    }

    /// Resolve a request according to the documented order.
    pub fn route(&self, domain: &str, path: &str, http_user: &str) -> Option<Arc<P>> {
        let index = self.index.read().unwrap();

        let mut domains = Vec::new();
        domains.push(domain.to_string());
        // a.b.c.d tries *.b.c.d then *.c.d, keeping at least two real labels.
        let labels: Vec<&str> = domain.split('.').collect();
        if labels.len() >= 3 {
            for skip in 1..=labels.len() - 2 {
                domains.push(format!("*.{}", labels[skip..].join(".")));
            }
        }
        domains.push("*".to_string());

        for d in &domains {
            let Some(by_user) = index.get(d) else {
                continue;
            };
            for user in [http_user, ""] {
                if let Some(entries) = by_user.get(user) {
                    // Entries are longest-first, so the first prefix hit is
                    // the longest match.
                    if let Some(entry) =
                        entries.iter().find(|e| path.starts_with(&e.location))
                    {
                        return Some(Arc::clone(&entry.payload));
                    }
                }
                if http_user.is_empty() {
                    break;
                }
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().unwrap().is_empty()
    }
}

impl<P> Default for VhostRouters<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routers() -> VhostRouters<&'static str> {
        VhostRouters::new()
    }

    #[test]
    fn test_insert_then_lookup() {
        let r = routers();
        r.add("a.example.com", "/", "", Arc::new("root")).unwrap();
        assert_eq!(*r.route("a.example.com", "/index.html", "").unwrap(), "root");
    }

    #[test]
    fn test_duplicate_route_conflicts() {
        let r = routers();
        r.add("a.example.com", "/", "", Arc::new("one")).unwrap();
        match r.add("a.example.com", "/", "", Arc::new("two")) {
            Err(ServerError::RouteConflict { .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_longest_location_prefix_wins() {
        let r = routers();
        r.add("a.example.com", "/", "", Arc::new("root")).unwrap();
        r.add("a.example.com", "/api", "", Arc::new("api")).unwrap();
        assert_eq!(*r.route("a.example.com", "/api/v1", "").unwrap(), "api");
        assert_eq!(*r.route("a.example.com", "/web", "").unwrap(), "root");
    }

    #[test]
    fn test_specific_beats_wildcard() {
        let r = routers();
        r.add("*.example.com", "/", "", Arc::new("wild")).unwrap();
        r.add("a.example.com", "/", "", Arc::new("exact")).unwrap();
        assert_eq!(*r.route("a.example.com", "/", "").unwrap(), "exact");
        assert_eq!(*r.route("b.example.com", "/", "").unwrap(), "wild");
        // Deeper subdomains walk label by label.
        assert_eq!(*r.route("x.a.example.com", "/", "").unwrap(), "wild");
    }

    #[test]
    fn test_catch_all_is_last() {
        let r = routers();
        r.add("*", "/", "", Arc::new("fallback")).unwrap();
        r.add("*.example.com", "/", "", Arc::new("wild")).unwrap();
        assert_eq!(*r.route("a.example.com", "/", "").unwrap(), "wild");
        assert_eq!(*r.route("other.net", "/", "").unwrap(), "fallback");
    }

    #[test]
    fn test_no_wildcard_no_match() {
        let r = routers();
        r.add("a.example.com", "/", "", Arc::new("exact")).unwrap();
        assert!(r.route("x.a.example.com", "/", "").is_none());
    }

    #[test]
    fn test_http_user_preferred_then_empty() {
        let r = routers();
        r.add("a.example.com", "/", "", Arc::new("anon")).unwrap();
        r.add("a.example.com", "/", "alice", Arc::new("alice")).unwrap();
        assert_eq!(*r.route("a.example.com", "/", "alice").unwrap(), "alice");
        assert_eq!(*r.route("a.example.com", "/", "bob").unwrap(), "anon");
        assert_eq!(*r.route("a.example.com", "/", "").unwrap(), "anon");
    }

    #[test]
    fn test_remove_restores_pre_registration_state() {
        let r = routers();
        r.add("a.example.com", "/", "", Arc::new("one")).unwrap();
        r.remove("a.example.com", "/", "");
        assert!(r.route("a.example.com", "/", "").is_none());
        assert!(r.is_empty());
        // Name is reusable afterwards.
        r.add("a.example.com", "/", "", Arc::new("two")).unwrap();
        assert_eq!(*r.route("a.example.com", "/", "").unwrap(), "two");
    }
}
