//! Request metadata and counter key composition.

/// What the limiter needs to know about an incoming request.
///
/// Filled in by the framework adapter. `subject` and `tier` are only present
/// when upstream authentication attached them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestInfo {
    /// HTTP method, e.g. `GET`
    pub method: String,
    /// Matched route template, e.g. `/users/{id}`
    pub route: String,
    /// Client address
    pub client_ip: Option<String>,
    /// Authenticated caller id
    pub subject: Option<String>,
    /// Membership tier as attached upstream
    pub tier: Option<String>,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, route: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            route: route.into(),
            ..Default::default()
        }
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    /// Caller identity used for accounting: authenticated subject first,
    /// client address otherwise.
    pub fn identity(&self) -> String {
        match (&self.subject, &self.client_ip) {
            (Some(subject), _) => format!("user:{}", subject),
            (None, Some(ip)) => format!("ip:{}", ip),
            (None, None) => "ip:unknown".to_string(),
        }
    }
}

/// A key that uniquely identifies one rate limit counter.
///
/// Composed of the tier (when known), method, route template and caller
/// identity, so the same caller on the same route is still counted
/// separately per tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub tier: Option<String>,
    pub method: String,
    pub route: String,
    pub identity: String,
}

impl RateLimitKey {
    pub fn from_request(request: &RequestInfo) -> Self {
        Self {
            tier: request.tier.clone(),
            method: request.method.to_ascii_uppercase(),
            route: request.route.clone(),
            identity: request.identity(),
        }
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(tier) = &self.tier {
            write!(f, "{}:", tier)?;
        }
        write!(f, "{}:{}:{}", self.method, self.route, self.identity)
    }
}
