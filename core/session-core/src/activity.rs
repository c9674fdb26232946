//! Activity sources feeding idle resets.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivitySource {
    User,
    Router,
    Http,
    Manual,
    CrossTab,
}

impl ActivitySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivitySource::User => "user",
            ActivitySource::Router => "router",
            ActivitySource::Http => "http",
            ActivitySource::Manual => "manual",
            ActivitySource::CrossTab => "crosstab",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(ActivitySource::User),
            "router" => Some(ActivitySource::Router),
            "http" => Some(ActivitySource::Http),
            "manual" => Some(ActivitySource::Manual),
            "crosstab" => Some(ActivitySource::CrossTab),
            _ => None,
        }
    }
}

/// Echo of every activity signal, whether or not it reset the idle timer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub source: ActivitySource,
    pub at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    /// False when the signal was ignored (cooldown, pause, expired or
    /// stopped session).
    pub accepted: bool,
}
