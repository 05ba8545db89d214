use std::path::PathBuf;

use anyhow::Context;
use pulsegrid_core::{ArpMode, ArpParams};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub sequencer: SequencerConfig,
    #[serde(default)]
    pub arpeggiator: ArpeggiatorConfig,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub bpm: f64,
    pub sample_rate: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bpm: 120.0,
            sample_rate: 48000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    pub notes_per_measure: usize,
    pub octave: i32,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            notes_per_measure: 16,
            octave: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ArpeggiatorConfig {
    pub mode: ArpMode,
    pub rate: f32,
    pub gate: f32,
    pub octaves: u8,
    pub tempo_sync: bool,
}

impl Default for ArpeggiatorConfig {
    fn default() -> Self {
        let params = ArpParams::default();
        Self {
            mode: params.mode,
            rate: params.rate,
            gate: params.gate,
            octaves: params.octaves,
            tempo_sync: params.tempo_sync,
        }
    }
}

impl ArpeggiatorConfig {
    /// Enabled parameters, clamped into range
    pub fn params(&self) -> ArpParams {
        ArpParams {
            enabled: true,
            mode: self.mode,
            tempo_sync: self.tempo_sync,
            rate: self.rate,
            gate: self.gate,
            octaves: self.octaves,
        }
        .clamped()
    }
}

pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pulsegrid")
        .join("config.toml")
}

/// Missing or unreadable config falls back to defaults
pub fn load_config() -> AppConfig {
    let path = config_path();
    let Ok(s) = std::fs::read_to_string(&path) else {
        return AppConfig::default();
    };
    parse_config(&s).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "ignoring invalid config");
        AppConfig::default()
    })
}

fn parse_config(s: &str) -> Result<AppConfig, toml::de::Error> {
    toml::from_str(s)
}

pub fn save_config(config: &AppConfig) -> anyhow::Result<PathBuf> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let s = toml::to_string_pretty(config)?;
    std::fs::write(&path, s).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}
