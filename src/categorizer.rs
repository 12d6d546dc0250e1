//! AQI categorization.
//!
//! Maps a validated AQI value onto the US EPA category breakpoints and a
//! coarse health tier. Every read path (current, historical, rankings,
//! predictions) goes through these functions so that a breakpoint change
//! applies everywhere at once.

use serde::{Deserialize, Serialize};

// ---

/// Health tiers, in order of increasing severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AqiCategory {
    Good,
    Moderate,
    UnhealthySensitive,
    Unhealthy,
    VeryUnhealthy,
    Hazardous,
}

/// Coarse two-level status attached to aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Acceptable,
    Concerning,
}

/// Category for an AQI value. Breakpoints are closed on the upper side.
pub fn category(aqi: f64) -> AqiCategory {
    // ---
    if aqi <= 50.0 {
        AqiCategory::Good
    } else if aqi <= 100.0 {
        AqiCategory::Moderate
    } else if aqi <= 150.0 {
        AqiCategory::UnhealthySensitive
    } else if aqi <= 200.0 {
        AqiCategory::Unhealthy
    } else if aqi <= 300.0 {
        AqiCategory::VeryUnhealthy
    } else {
        AqiCategory::Hazardous
    }
}

pub fn health_status(aqi: f64) -> HealthStatus {
    // ---
    if aqi <= 100.0 {
        HealthStatus::Acceptable
    } else {
        HealthStatus::Concerning
    }
}

impl AqiCategory {
    /// Human readable label, as shown to end users.
    pub fn label(self) -> &'static str {
        // ---
        match self {
            AqiCategory::Good => "Good",
            AqiCategory::Moderate => "Moderate",
            AqiCategory::UnhealthySensitive => "Unhealthy for Sensitive Groups",
            AqiCategory::Unhealthy => "Unhealthy",
            AqiCategory::VeryUnhealthy => "Very Unhealthy",
            AqiCategory::Hazardous => "Hazardous",
        }
    }

    pub fn status_emoji(self) -> &'static str {
        // ---
        match self {
            AqiCategory::Good => "🟢",
            AqiCategory::Moderate => "🟡",
            AqiCategory::UnhealthySensitive => "🟠",
            AqiCategory::Unhealthy => "🔴",
            AqiCategory::VeryUnhealthy => "🟣",
            AqiCategory::Hazardous => "🟤",
        }
    }

    /// Inverse of [`AqiCategory::as_str`], used when reading stored rows.
    pub fn parse(s: &str) -> Option<Self> {
        // ---
        match s {
            "good" => Some(AqiCategory::Good),
            "moderate" => Some(AqiCategory::Moderate),
            "unhealthy_sensitive" => Some(AqiCategory::UnhealthySensitive),
            "unhealthy" => Some(AqiCategory::Unhealthy),
            "very_unhealthy" => Some(AqiCategory::VeryUnhealthy),
            "hazardous" => Some(AqiCategory::Hazardous),
            _ => None,
        }
    }

    /// Storage and wire name; matches the serde representation.
    pub fn as_str(self) -> &'static str {
        // ---
        match self {
            AqiCategory::Good => "good",
            AqiCategory::Moderate => "moderate",
            AqiCategory::UnhealthySensitive => "unhealthy_sensitive",
            AqiCategory::Unhealthy => "unhealthy",
            AqiCategory::VeryUnhealthy => "very_unhealthy",
            AqiCategory::Hazardous => "hazardous",
        }
    }
}

impl HealthStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Acceptable => "acceptable",
            HealthStatus::Concerning => "concerning",
        }
    }
}
