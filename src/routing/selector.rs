use crate::config::ServicesConfig;
use std::collections::HashMap;

/// Result of resolving a request path against the selector table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    /// Target service name (exists in the descriptor table).
    pub service: String,
    /// Upstream path, beginning with `/` and retaining the selector segment
    /// (upstreams expect `/courses/{id}`, not `/{id}`).
    pub endpoint: String,
}

/// Pure path → (service, endpoint) router over a static prefix table.
///
/// Matching is exact on the first path segment after an optional leading
/// `api/` — no longest-prefix search, no patterns. Built once at startup
/// from the service table (identity selectors) plus the alias map.
pub struct Router {
    table: HashMap<String, String>,
    selectors: Vec<String>,
}

impl Router {
    pub fn new(services: &ServicesConfig) -> Self {
        let mut table: HashMap<String, String> = services
            .urls
            .keys()
            .map(|name| (name.clone(), name.clone()))
            .collect();
        for (selector, service) in &services.selector_aliases {
            table.insert(selector.clone(), service.clone());
        }

        let mut selectors: Vec<String> = table.keys().cloned().collect();
        selectors.sort();

        Self { table, selectors }
    }

    /// Resolve a request path to a service and upstream endpoint.
    ///
    /// Returns `None` when the path has no selector segment or the selector
    /// is not in the table; the caller decides how to report the miss.
    pub fn resolve(&self, path: &str) -> Option<RouteMatch> {
        let trimmed = path.trim_start_matches('/');
        let rest = trimmed.strip_prefix("api/").unwrap_or(trimmed);
        if rest.is_empty() || rest == "api" {
            return None;
        }

        let selector = rest.split('/').next().unwrap_or("");
        let service = self.table.get(selector)?;

        Some(RouteMatch {
            service: service.clone(),
            endpoint: format!("/{}", rest.trim_end_matches('/')),
        })
    }

    /// Recognized selectors, sorted — used in router-miss error bodies.
    pub fn selectors(&self) -> &[String] {
        &self.selectors
    }
}
