//! Static limit presets per environment and tier.
//!
//! The built-in table can be overridden from YAML. Environments left out
//! keep their built-in rows:
//!
//! ```yaml
//! production:
//!   free:    { window_secs: 900, max_requests: 100 }
//!   premium: { window_secs: 900, max_requests: 1000 }
//!   admin:   { window_secs: 900, max_requests: 10000 }
//! routes:
//!   auth: { window_secs: 900, max_requests: 5, status_code: 423 }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::error::{Result, WardenError};
use crate::ratelimit::MAX_DURATION_MS;

/// Longest window a preset may declare.
const MAX_WINDOW_SECS: u64 = (MAX_DURATION_MS / 1000) as u64;
const FIFTEEN_MINUTES: u64 = 15 * 60;

/// Deployment environment, selecting how generous the presets are.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    #[serde(alias = "dev")]
    Development,
    #[serde(alias = "test")]
    Testing,
    #[serde(alias = "prod")]
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Testing => "testing",
            Environment::Production => "production",
        }
    }
}

impl FromStr for Environment {
    type Err = WardenError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "testing" | "test" => Ok(Environment::Testing),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(WardenError::Config(format!("Unknown environment: {}", other))),
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Caller classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Premium,
    Admin,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Premium, Tier::Admin];

    /// Parse a tier label. Anything unrecognised is the most restrictive
    /// tier.
    pub fn parse(value: &str) -> Tier {
        match value.trim().to_ascii_lowercase().as_str() {
            "premium" => Tier::Premium,
            "admin" => Tier::Admin,
            _ => Tier::Free,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
            Tier::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Window and quota for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierPolicy {
    pub window_secs: u64,
    pub max_requests: u64,
}

impl TierPolicy {
    pub const fn new(window_secs: u64, max_requests: u64) -> Self {
        Self {
            window_secs,
            max_requests,
        }
    }
}

/// Tier policies for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentPresets {
    pub free: TierPolicy,
    pub premium: TierPolicy,
    pub admin: TierPolicy,
}

impl EnvironmentPresets {
    pub fn policy(&self, tier: Tier) -> TierPolicy {
        match tier {
            Tier::Free => self.free,
            Tier::Premium => self.premium,
            Tier::Admin => self.admin,
        }
    }
}

/// A named policy for a route group, e.g. authentication endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePreset {
    pub window_secs: u64,
    pub max_requests: u64,
    /// Overrides the default rejection status
    #[serde(default)]
    pub status_code: Option<u16>,
    /// Overrides the default rejection message
    #[serde(default)]
    pub message: Option<String>,
}

/// The full preset table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetTable {
    #[serde(default = "development_presets")]
    pub development: EnvironmentPresets,
    #[serde(default = "testing_presets")]
    pub testing: EnvironmentPresets,
    #[serde(default = "production_presets")]
    pub production: EnvironmentPresets,
    #[serde(default = "route_presets")]
    pub routes: HashMap<String, RoutePreset>,
}

fn development_presets() -> EnvironmentPresets {
    EnvironmentPresets {
        free: TierPolicy::new(FIFTEEN_MINUTES, 1_000),
        premium: TierPolicy::new(FIFTEEN_MINUTES, 10_000),
        admin: TierPolicy::new(FIFTEEN_MINUTES, 100_000),
    }
}

fn testing_presets() -> EnvironmentPresets {
    EnvironmentPresets {
        free: TierPolicy::new(60, 10_000),
        premium: TierPolicy::new(60, 50_000),
        admin: TierPolicy::new(60, 100_000),
    }
}

fn production_presets() -> EnvironmentPresets {
    EnvironmentPresets {
        free: TierPolicy::new(FIFTEEN_MINUTES, 100),
        premium: TierPolicy::new(FIFTEEN_MINUTES, 1_000),
        admin: TierPolicy::new(FIFTEEN_MINUTES, 10_000),
    }
}

fn route_presets() -> HashMap<String, RoutePreset> {
    let mut routes = HashMap::new();
    routes.insert(
        "general".to_string(),
        RoutePreset {
            window_secs: FIFTEEN_MINUTES,
            max_requests: 100,
            status_code: None,
            message: None,
        },
    );
    routes.insert(
        "auth".to_string(),
        RoutePreset {
            window_secs: FIFTEEN_MINUTES,
            max_requests: 5,
            status_code: Some(423),
            message: Some("Too many authentication attempts, please try again later.".to_string()),
        },
    );
    routes
}

impl Default for PresetTable {
    fn default() -> Self {
        Self {
            development: development_presets(),
            testing: testing_presets(),
            production: production_presets(),
            routes: route_presets(),
        }
    }
}

fn valid_window(window_secs: u64) -> bool {
    (1..=MAX_WINDOW_SECS).contains(&window_secs)
}

impl PresetTable {
    /// Load a preset table from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit presets");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a preset table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let table: PresetTable = serde_yaml::from_str(yaml)
            .map_err(|e| WardenError::Config(format!("Failed to parse rate limit presets: {}", e)))?;
        table.validate()?;
        Ok(table)
    }

    pub fn environment(&self, environment: Environment) -> &EnvironmentPresets {
        match environment {
            Environment::Development => &self.development,
            Environment::Testing => &self.testing,
            Environment::Production => &self.production,
        }
    }

    pub fn policy(&self, environment: Environment, tier: Tier) -> TierPolicy {
        self.environment(environment).policy(tier)
    }

    pub fn route(&self, name: &str) -> Option<&RoutePreset> {
        self.routes.get(name)
    }

    /// Every window must be positive and at most a year; every quota must be
    /// positive.
    pub fn validate(&self) -> Result<()> {
        let environments = [
            Environment::Development,
            Environment::Testing,
            Environment::Production,
        ];
        for environment in environments {
            for tier in Tier::ALL {
                let policy = self.policy(environment, tier);
                if !valid_window(policy.window_secs) || policy.max_requests == 0 {
                    return Err(WardenError::InvalidConfiguration(format!(
                        "{} preset for tier {} needs a window of 1..={}s and a positive quota",
                        environment, tier, MAX_WINDOW_SECS
                    )));
                }
            }
        }
        for (name, route) in &self.routes {
            if !valid_window(route.window_secs) || route.max_requests == 0 {
                return Err(WardenError::InvalidConfiguration(format!(
                    "route preset {} needs a window of 1..={}s and a positive quota",
                    name, MAX_WINDOW_SECS
                )));
            }
        }
        Ok(())
    }
}
