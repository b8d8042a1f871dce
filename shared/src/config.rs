use std::collections::BTreeMap;

/// World settings handed to every client in its introduction.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, ts_rs::TS)]
#[ts(export, export_to = "../../web/generated/")]
#[serde(rename_all = "camelCase")]
pub struct WorldConfig {
    /// Uniform avatar scale
    pub player_scale: f64,
    /// Multiplier applied to the distance at which voices fade out
    pub voice_distance_multiplier: f64,
    pub current_map_url: String,
    pub fallback_map_url: String,
    /// Map name -> url
    pub available_maps: BTreeMap<String, String>,
}

impl Default for WorldConfig {
    fn default() -> Self {
        let fallback = "models/fallback.glb".to_string();
        let mut available_maps = BTreeMap::new();
        available_maps.insert("Default".to_string(), fallback.clone());
        Self {
            player_scale: 1.0,
            voice_distance_multiplier: 1.0,
            current_map_url: fallback.clone(),
            fallback_map_url: fallback,
            available_maps,
        }
    }
}

impl WorldConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.player_scale.is_finite() || self.player_scale <= 0.0 {
            return Err("player_scale must be finite and > 0".to_string());
        }
        if !self.voice_distance_multiplier.is_finite() || self.voice_distance_multiplier < 0.0 {
            return Err("voice_distance_multiplier must be finite and >= 0".to_string());
        }
        if self.fallback_map_url.is_empty() {
            return Err("fallback_map_url must not be empty".to_string());
        }
        if self.current_map_url.is_empty() {
            return Err("current_map_url must not be empty".to_string());
        }
        Ok(())
    }
}
