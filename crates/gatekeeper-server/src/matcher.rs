//! Method + path template route table resolving requests to endpoint codes.
//!
//! One `matchit` router per HTTP method sits behind a single `RwLock`.
//! Lookups take the read lock; `add` and `remove_code` take the write lock only for
//! the mutation itself.

use std::collections::HashMap;

use gatekeeper_core::ApiEndpoint;
use parking_lot::RwLock;

/// A registered route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub method: String,
    /// Normalized template in `{param}` / `{*rest}` syntax.
    pub template: String,
    pub code: String,
}

impl Route {
    pub fn new(method: &str, template: &str, code: impl Into<String>) -> Self {
        Self {
            method: method.trim().to_ascii_uppercase(),
            template: normalize_template(template),
            code: code.into(),
        }
    }
}

impl From<&ApiEndpoint> for Route {
    fn from(endpoint: &ApiEndpoint) -> Self {
        Route::new(&endpoint.method, &endpoint.path_template, endpoint.code.clone())
    }
}

/// Outcome of [`Matcher::add`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    /// The identical route was already present.
    AlreadyPresent,
    /// Another code owns the same method and path, or the template overlaps an
    /// existing wildcard.
    Conflict(String),
}

#[derive(Default)]
struct RouteTable {
    routers: HashMap<String, matchit::Router<String>>,
    routes: Vec<Route>,
}

impl RouteTable {
    fn find(&self, method: &str, template: &str) -> Option<&Route> {
        self.routes
            .iter()
            .find(|r| r.method == method && r.template == template)
    }

    fn insert(&mut self, route: Route) -> AddOutcome {
        if let Some(existing) = self.find(&route.method, &route.template) {
            if existing.code == route.code {
                return AddOutcome::AlreadyPresent;
            }
            return AddOutcome::Conflict(format!(
                "{} {} already mapped to {}",
                route.method, route.template, existing.code
            ));
        }

        let router = self.routers.entry(route.method.clone()).or_default();
        if let Err(e) = router.insert(route.template.clone(), route.code.clone()) {
            return AddOutcome::Conflict(e.to_string());
        }
        self.routes.push(route);
        AddOutcome::Inserted
    }

    fn build<I: IntoIterator<Item = Route>>(routes: I) -> Self {
        let mut table = RouteTable::default();
        for route in routes {
            match table.insert(route.clone()) {
                AddOutcome::Inserted => {}
                AddOutcome::AlreadyPresent => {
                    tracing::warn!(
                        method = %route.method,
                        template = %route.template,
                        code = %route.code,
                        "duplicate route skipped"
                    );
                }
                AddOutcome::Conflict(reason) => {
                    tracing::warn!(
                        method = %route.method,
                        template = %route.template,
                        code = %route.code,
                        %reason,
                        "conflicting route skipped"
                    );
                }
            }
        }
        table
    }
}

/// Concurrent route table.
#[derive(Default)]
pub struct Matcher {
    table: RwLock<RouteTable>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole table. The first route for a `(method, path)` wins;
    /// later duplicates are skipped with a warning. Returns the number loaded.
    pub fn load<I: IntoIterator<Item = Route>>(&self, routes: I) -> usize {
        let table = RouteTable::build(routes);
        let loaded = table.routes.len();
        *self.table.write() = table;
        tracing::info!(routes = loaded, "route table loaded");
        loaded
    }

    pub fn load_endpoints(&self, endpoints: &[ApiEndpoint]) -> usize {
        self.load(endpoints.iter().map(Route::from))
    }

    /// Inserts one route into the live table. Adding an identical route again
    /// is a no-op.
    pub fn add(&self, route: Route) -> AddOutcome {
        let outcome = self.table.write().insert(route.clone());
        match &outcome {
            AddOutcome::Inserted => {
                tracing::info!(method = %route.method, template = %route.template, code = %route.code, "route added");
            }
            AddOutcome::AlreadyPresent => {
                tracing::debug!(code = %route.code, "route already present");
            }
            AddOutcome::Conflict(reason) => {
                tracing::warn!(code = %route.code, %reason, "route not added");
            }
        }
        outcome
    }

    /// Removes every route mapped to `code` by rebuilding from the remaining
    /// routes. Returns how many were removed.
    pub fn remove_code(&self, code: &str) -> usize {
        let mut guard = self.table.write();
        let before = guard.routes.len();
        let remaining: Vec<Route> = guard
            .routes
            .iter()
            .filter(|r| r.code != code)
            .cloned()
            .collect();
        let removed = before - remaining.len();
        if removed > 0 {
            *guard = RouteTable::build(remaining);
            tracing::info!(code, removed, "routes dropped");
        }
        removed
    }

    /// Resolves a request to its endpoint code. `None` means no route.
    pub fn match_route(&self, method: &str, path: &str) -> Option<String> {
        let method = method.to_ascii_uppercase();
        let path = normalize_path(path);
        let table = self.table.read();
        let router = table.routers.get(&method)?;
        router.at(&path).ok().map(|m| m.value.clone())
    }

    pub fn len(&self) -> usize {
        self.table.read().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn routes(&self) -> Vec<Route> {
        self.table.read().routes.clone()
    }
}

/// Ensures a leading `/`.
pub fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// Rewrites `:name` and `*name` segments into `{name}` and `{*name}`.
pub fn normalize_template(template: &str) -> String {
    let path = normalize_path(template.trim());
    path.split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                format!("{{{name}}}")
            } else if let Some(name) = segment.strip_prefix('*') {
                let name = if name.is_empty() { "rest" } else { name };
                format!("{{*{name}}}")
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> Matcher {
        let m = Matcher::new();
        m.load(vec![
            Route::new("GET", "/e1", "E1"),
            Route::new("GET", "/users/:id", "USER"),
            Route::new("POST", "/users/{id}/orders", "ORDER"),
            Route::new("get", "files/*path", "FILES"),
        ]);
        m
    }

    #[test]
    fn test_normalize_template() {
        assert_eq!(normalize_template("users/:id"), "/users/{id}");
        assert_eq!(normalize_template("/users/{id}"), "/users/{id}");
        assert_eq!(normalize_template("/files/*path"), "/files/{*path}");
        assert_eq!(normalize_template("/files/*"), "/files/{*rest}");
    }

    #[test]
    fn test_match_registered_routes() {
        let m = matcher();
        assert_eq!(m.match_route("GET", "/e1").as_deref(), Some("E1"));
        assert_eq!(m.match_route("get", "users/42").as_deref(), Some("USER"));
        assert_eq!(
            m.match_route("POST", "/users/42/orders").as_deref(),
            Some("ORDER")
        );
        assert_eq!(m.match_route("GET", "/files/a/b.txt").as_deref(), Some("FILES"));
    }

    #[test]
    fn test_unregistered_route_is_not_found() {
        let m = matcher();
        assert_eq!(m.match_route("POST", "/unknown"), None);
        assert_eq!(m.match_route("DELETE", "/e1"), None);
        assert_eq!(m.match_route("GET", "/users/42/orders"), None);
    }

    #[test]
    fn test_load_skips_duplicates_first_wins() {
        let m = Matcher::new();
        let loaded = m.load(vec![
            Route::new("GET", "/e1", "E1"),
            Route::new("GET", "e1", "E1-DUP"),
        ]);
        assert_eq!(loaded, 1);
        assert_eq!(m.match_route("GET", "/e1").as_deref(), Some("E1"));
    }

    #[test]
    fn test_add_is_idempotent() {
        let m = matcher();
        assert_eq!(m.add(Route::new("GET", "/e2", "E2")), AddOutcome::Inserted);
        assert_eq!(m.add(Route::new("GET", "/e2", "E2")), AddOutcome::AlreadyPresent);
        assert!(matches!(
            m.add(Route::new("GET", "/e2", "OTHER")),
            AddOutcome::Conflict(_)
        ));
        assert_eq!(m.match_route("GET", "/e2").as_deref(), Some("E2"));
        assert_eq!(m.len(), 5);
    }

    #[test]
    fn test_remove_code_removes_every_route() {
        let m = matcher();
        m.add(Route::new("DELETE", "/users/:id", "USER"));

        assert_eq!(m.remove_code("USER"), 2);
        assert_eq!(m.match_route("GET", "/users/1"), None);
        assert_eq!(m.match_route("DELETE", "/users/1"), None);
        assert_eq!(m.match_route("GET", "/e1").as_deref(), Some("E1"));
        assert_eq!(
            m.match_route("POST", "/users/1/orders").as_deref(),
            Some("ORDER")
        );
        assert_eq!(m.remove_code("USER"), 0);
    }

    #[test]
    fn test_concurrent_lookups_during_mutation() {
        use std::sync::Arc;

        let m = Arc::new(matcher());
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        assert_eq!(m.match_route("GET", "/e1").as_deref(), Some("E1"));
                    }
                })
            })
            .collect();

        for i in 0..50 {
            m.add(Route::new("GET", &format!("/dyn/{i}"), format!("D{i}")));
        }
        m.remove_code("D0");

        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(m.match_route("GET", "/dyn/7").as_deref(), Some("D7"));
        assert_eq!(m.match_route("GET", "/dyn/0"), None);
    }
}
