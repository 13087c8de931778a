//! Caller tiers and environment presets.
//!
//! Callers are classified as free, premium or admin, and each class gets its
//! own window and quota from a [`PresetTable`] row chosen by the deployment
//! [`Environment`].

mod presets;
mod resolver;
mod tiered;

pub use presets::{Environment, EnvironmentPresets, PresetTable, RoutePreset, Tier, TierPolicy};
pub use resolver::{AccountDirectory, DirectoryError, TierResolver};
pub use tiered::TieredLimiter;
