//! Bulb capability detection.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use strum_macros::Display;

/// A capability a bulb advertises.
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display,
)]
pub enum Feature {
    Color,
    ColorTemperature,
    Brightness,
    Flow,
    MusicMode,
    NightLight,
}

impl Feature {
    /// Map a method token from the SSDP `support:` header to a feature.
    fn from_support_token(token: &str) -> Option<Self> {
        match token {
            "set_rgb" => Some(Feature::Color),
            "set_ct_abx" => Some(Feature::ColorTemperature),
            "set_bright" => Some(Feature::Brightness),
            "start_cf" => Some(Feature::Flow),
            "set_music" => Some(Feature::MusicMode),
            "set_ps" => Some(Feature::NightLight),
            _ => None,
        }
    }
}

/// The set of capabilities a bulb advertises.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct FeatureSet(BTreeSet<Feature>);

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the space-separated method list from an SSDP `support:` header.
    ///
    /// Tokens that don't map to a feature are ignored.
    ///
    /// # Examples
    ///
    /// ```
    /// use yeelight_rs::{Feature, FeatureSet};
    ///
    /// let features = FeatureSet::from_support("get_prop set_power set_bright set_rgb start_cf");
    /// assert!(features.contains(Feature::Color));
    /// assert!(features.contains(Feature::Brightness));
    /// assert!(features.contains(Feature::Flow));
    /// assert!(!features.contains(Feature::MusicMode));
    /// ```
    pub fn from_support(support: &str) -> Self {
        Self(
            support
                .split_ascii_whitespace()
                .filter_map(Feature::from_support_token)
                .collect(),
        )
    }

    pub fn contains(&self, feature: Feature) -> bool {
        self.0.contains(&feature)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Feature> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
