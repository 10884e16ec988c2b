use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::{TilingError, TilingResult};
use crate::geometry::CropSpec;
use crate::store::EvictionPolicy;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "TESSERA_DATA_DIR";
pub const ENV_PLUGIN_CONFIG: &str = "TESSERA_PLUGIN_CONFIG";

pub const DEFAULT_CROP: usize = 224;
pub const DEFAULT_STRIDE: usize = 200;
pub const DEFAULT_DELTA: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub tiling: TiledInferenceParameters,
    pub store: StoreConfig,
    pub output: OutputConfig,
}

/// Tiling section as written by users. `crop`/`stride` are shorthands for
/// setting both axes; see [`TiledInferenceParameters::normalize`].
///
/// No struct-level `serde(default)`: a present `[tiling]` table must name its
/// crop explicitly, only an absent table falls back to [`Default`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TiledInferenceParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h_crop: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w_crop: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stride: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h_stride: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w_stride: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<usize>,
}

/// Validated four-field tiling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TilingParameters {
    pub h_crop: usize,
    pub w_crop: usize,
    pub h_stride: usize,
    pub w_stride: usize,
    pub delta: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EvictionMode {
    #[default]
    Manual,
    Ttl,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub eviction: EvictionMode,
    pub ttl_secs: u64,
    pub reap_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    pub output_path: PathBuf,
}

/// JSON carried in `TESSERA_PLUGIN_CONFIG`. Only fields that are present
/// override the file config.
#[derive(Debug, Clone, Default, Deserialize)]
struct PluginEnvConfig {
    output_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tiling: TiledInferenceParameters::default(),
            store: StoreConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl Default for TiledInferenceParameters {
    fn default() -> Self {
        Self {
            crop: None,
            h_crop: Some(DEFAULT_CROP),
            w_crop: Some(DEFAULT_CROP),
            stride: None,
            h_stride: Some(DEFAULT_STRIDE),
            w_stride: Some(DEFAULT_STRIDE),
            delta: Some(DEFAULT_DELTA),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            eviction: EvictionMode::Manual,
            ttl_secs: 3600,
            reap_interval_secs: 60,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_path: PathBuf::from("output"),
        }
    }
}

impl TiledInferenceParameters {
    /// Resolve the `crop`/`stride` shorthands into the four-field form and
    /// validate it. Explicit `h_crop` + `w_crop` win over `crop`; `stride`
    /// wins over `h_stride`/`w_stride`.
    pub fn normalize(&self) -> TilingResult<TilingParameters> {
        let (h_crop, w_crop) = match (self.h_crop, self.w_crop, self.crop) {
            (Some(h), Some(w), _) => (h, w),
            (_, _, Some(crop)) => (crop, crop),
            _ => {
                return Err(TilingError::Config(
                    "expected 'crop' (or both 'h_crop' and 'w_crop') in tiling parameters"
                        .to_string(),
                ))
            }
        };
        let (h_stride, w_stride) = match self.stride {
            Some(stride) => (stride, stride),
            None => (
                self.h_stride.unwrap_or(DEFAULT_STRIDE),
                self.w_stride.unwrap_or(DEFAULT_STRIDE),
            ),
        };

        let params = TilingParameters {
            h_crop,
            w_crop,
            h_stride,
            w_stride,
            delta: self.delta.unwrap_or(DEFAULT_DELTA),
        };
        params.validate()?;
        Ok(params)
    }
}

impl TilingParameters {
    pub fn validate(&self) -> TilingResult<()> {
        for (name, value) in [
            ("h_crop", self.h_crop),
            ("w_crop", self.w_crop),
            ("h_stride", self.h_stride),
            ("w_stride", self.w_stride),
        ] {
            if value == 0 {
                return Err(TilingError::Config(format!("{name} must be positive")));
            }
        }
        if self.h_stride > self.h_crop {
            return Err(TilingError::Config(format!(
                "h_stride ({}) must not exceed h_crop ({})",
                self.h_stride, self.h_crop
            )));
        }
        if self.w_stride > self.w_crop {
            return Err(TilingError::Config(format!(
                "w_stride ({}) must not exceed w_crop ({})",
                self.w_stride, self.w_crop
            )));
        }
        Ok(())
    }

    pub fn crop_spec(&self) -> CropSpec {
        CropSpec {
            h_crop: self.h_crop,
            w_crop: self.w_crop,
            h_stride: self.h_stride,
            w_stride: self.w_stride,
        }
    }
}

impl StoreConfig {
    /// A TTL policy needs a positive TTL and reap interval; with either at
    /// zero the reaper would drop jobs still waiting for their outputs.
    pub fn validate(&self) -> TilingResult<()> {
        if self.eviction != EvictionMode::Ttl {
            return Ok(());
        }
        if self.ttl_secs == 0 {
            return Err(TilingError::Config(
                "ttl_secs must be positive when eviction = \"ttl\"".to_string(),
            ));
        }
        if self.reap_interval_secs == 0 {
            return Err(TilingError::Config(
                "reap_interval_secs must be positive when eviction = \"ttl\"".to_string(),
            ));
        }
        Ok(())
    }

    pub fn eviction_policy(&self) -> TilingResult<EvictionPolicy> {
        self.validate()?;
        Ok(match self.eviction {
            EvictionMode::Manual => EvictionPolicy::Manual,
            EvictionMode::Ttl => EvictionPolicy::Ttl(chrono::Duration::seconds(
                i64::try_from(self.ttl_secs)
                    .unwrap_or(i64::MAX)
                    .min(i64::MAX / 1000),
            )),
        })
    }

    pub fn reap_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.reap_interval_secs)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Overlay the JSON plugin config (usually from `TESSERA_PLUGIN_CONFIG`).
    pub fn apply_plugin_config(&mut self, raw_json: Option<&str>) -> Result<()> {
        let Some(raw_json) = raw_json.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(());
        };
        let plugin: PluginEnvConfig = serde_json::from_str(raw_json)
            .with_context(|| format!("failed to parse {ENV_PLUGIN_CONFIG} as JSON"))?;
        if let Some(output_path) = plugin.output_path {
            self.output.output_path = output_path;
        }
        Ok(())
    }

    /// Tiling parameters normalized and validated; called once at startup.
    pub fn tiling_parameters(&self) -> Result<TilingParameters> {
        self.tiling
            .normalize()
            .context("invalid [tiling] configuration")
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. TESSERA_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml if either is missing.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
