use reqwest::Url;

use crate::{
    config::GatewayConfig,
    error::{GatewayError, Result},
};

/// A configured path prefix and the service behind it
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub service: String,
    pub prefix: String,
    pub upstream: Url,
}

/// Longest-prefix route table. Built once, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct Router {
    // Sorted by prefix length, longest first
    routes: Vec<Route>,
}

/// Strip a trailing `/*` or `/` so `/api/a/*`, `/api/a/` and `/api/a` are
/// the same prefix
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('*').trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn has_dot_segment(path: &str) -> bool {
    path.split('/').any(|segment| {
        let decoded = segment.to_ascii_lowercase().replace("%2e", ".");
        decoded == "." || decoded == ".."
    })
}

impl Router {
    pub fn new(routes: impl IntoIterator<Item = Route>) -> Self {
        let mut routes: Vec<Route> = routes
            .into_iter()
            .map(|r| Route {
                prefix: normalize_prefix(&r.prefix),
                ..r
            })
            .collect();
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()).then_with(|| a.prefix.cmp(&b.prefix)));
        Self { routes }
    }

    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let routes = config
            .services
            .iter()
            .map(|s| {
                let upstream = Url::parse(&s.upstream).map_err(|e| {
                    GatewayError::Config(format!("service {}: invalid upstream: {}", s.name, e))
                })?;
                Ok(Route {
                    service: s.name.clone(),
                    prefix: s.path_prefix.clone(),
                    upstream,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::new(routes))
    }

    /// Resolve a request path to its service. Matches whole path segments
    /// only, so `/api/a` does not claim `/api/ab`. Paths with `.` or `..`
    /// segments are refused: the upstream URL would normalise them away and
    /// reach a different prefix than the one charged.
    pub fn resolve(&self, path: &str) -> Result<&Route> {
        if has_dot_segment(path) {
            return Err(GatewayError::InvalidRequest(format!(
                "path contains dot segments: {}",
                path
            )));
        }

        self.routes
            .iter()
            .find(|route| Self::matches(&route.prefix, path))
            .ok_or_else(|| GatewayError::NoRoute(path.to_string()))
    }

    fn matches(prefix: &str, path: &str) -> bool {
        if prefix == "/" {
            return path.starts_with('/');
        }
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.service.as_str())
    }
}
