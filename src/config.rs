//! Device configuration.
//!
//! The model is configured per [`Device`](crate::device::Device): hardware
//! generation (which selects the node format), identification UUIDs used for
//! serialized blob compatibility, and optional driver features that add
//! tables to the acceleration structure layout.
//!
//! Settings are read from `<config_dir>/radv-bvh/config.json` when present,
//! then overridden from the environment:
//!
//! - `RADV_BVH_GFX_LEVEL` - `gfx10_3`, `gfx11` or `gfx12`

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::util::{Error, Result};

/// Environment variable overriding [`DeviceConfig::gfx_level`].
pub const ENV_GFX_LEVEL: &str = "RADV_BVH_GFX_LEVEL";

/// Build id stamped by the build script, folded into the default cache UUID.
pub const BUILD_ID: &str = env!("RADV_BVH_BUILD_ID");

/// Payloads up to this size are written through the command processor.
pub const DEFAULT_CP_WRITE_THRESHOLD: u32 = 1024;

/// GPU generation. GFX12 and newer use the 8-wide compressed node format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GfxLevel {
    Gfx10_3,
    #[default]
    Gfx11,
    Gfx12,
}

impl GfxLevel {
    /// True if this generation uses the GFX12 box/primitive node layout.
    #[inline]
    pub fn uses_bvh8(self) -> bool {
        self >= GfxLevel::Gfx12
    }

    /// GFX11 box tests misbehave on infinite coordinates.
    #[inline]
    pub fn needs_no_infs(self) -> bool {
        self == GfxLevel::Gfx11
    }

    /// Cull flags are propagated into box nodes from GFX11 on.
    #[inline]
    pub fn propagates_cull_flags(self) -> bool {
        self >= GfxLevel::Gfx11
    }

    pub fn name(self) -> &'static str {
        match self {
            GfxLevel::Gfx10_3 => "gfx10_3",
            GfxLevel::Gfx11 => "gfx11",
            GfxLevel::Gfx12 => "gfx12",
        }
    }
}

impl FromStr for GfxLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gfx10_3" | "gfx10.3" | "gfx1030" => Ok(GfxLevel::Gfx10_3),
            "gfx11" | "gfx1100" => Ok(GfxLevel::Gfx11),
            "gfx12" | "gfx1200" => Ok(GfxLevel::Gfx12),
            other => Err(Error::Config(format!("unknown gfx level '{other}'"))),
        }
    }
}

/// Device configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Hardware generation
    pub gfx_level: GfxLevel,

    /// First half of the serialized blob version check
    pub driver_uuid: [u8; 16],
    /// Second half of the serialized blob version check
    pub cache_uuid: [u8; 16],

    /// rayTracingPositionFetch: adds the primitive-base-index table
    pub position_fetch: bool,
    /// RRA tracing: adds the geometry-info table
    pub rra_trace: bool,

    /// Largest payload written inline through the command processor
    pub cp_write_threshold: u32,
    /// Use the single-geometry fast path in GFX12 updates
    pub single_geometry_fast_path: bool,
    /// Worker threads for kernel execution (0 = one per core)
    pub worker_threads: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            gfx_level: GfxLevel::default(),
            driver_uuid: default_driver_uuid(),
            cache_uuid: default_cache_uuid(),
            position_fetch: false,
            rra_trace: false,
            cp_write_threshold: DEFAULT_CP_WRITE_THRESHOLD,
            single_geometry_fast_path: true,
            worker_threads: 0,
        }
    }
}

impl DeviceConfig {
    /// Config for a given generation with everything else defaulted.
    pub fn for_gfx(gfx_level: GfxLevel) -> Self {
        Self {
            gfx_level,
            ..Default::default()
        }
    }

    /// Default config file location.
    pub fn path() -> Option<PathBuf> {
        dirs::config_dir().map(|mut p| {
            p.push("radv-bvh");
            p.push("config.json");
            p
        })
    }

    /// Load from the default location, falling back to defaults, then
    /// apply environment overrides.
    pub fn load() -> Self {
        let mut config = match Self::path() {
            Some(path) if path.exists() => Self::from_file(&path).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable device config");
                Self::default()
            }),
            _ => Self::default(),
        };
        if let Err(e) = config.apply_env() {
            tracing::warn!(error = %e, "ignoring invalid environment override");
        }
        config
    }

    /// Read a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::ConfigNotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Apply `RADV_BVH_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(level) = std::env::var(ENV_GFX_LEVEL) {
            self.gfx_level = level.parse()?;
            tracing::debug!(gfx_level = self.gfx_level.name(), "gfx level from environment");
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.cp_write_threshold % 4 != 0 {
            return Err(Error::Config(format!(
                "cp_write_threshold must be a multiple of 4, got {}",
                self.cp_write_threshold
            )));
        }
        Ok(())
    }

    /// `driver_uuid | cache_uuid`, the prefix of every serialized blob.
    pub fn version_data(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[..16].copy_from_slice(&self.driver_uuid);
        out[16..].copy_from_slice(&self.cache_uuid);
        out
    }
}

fn default_driver_uuid() -> [u8; 16] {
    let mut uuid = [0u8; 16];
    let tag = b"radv-bvh";
    uuid[..tag.len()].copy_from_slice(tag);
    let version = env!("CARGO_PKG_VERSION").as_bytes();
    let n = version.len().min(16 - tag.len());
    uuid[tag.len()..tag.len() + n].copy_from_slice(&version[..n]);
    uuid
}

/// FNV-1a over the build id, spread across 16 bytes.
fn default_cache_uuid() -> [u8; 16] {
    let mut lo: u64 = 0xcbf2_9ce4_8422_2325;
    for b in BUILD_ID.bytes() {
        lo ^= b as u64;
        lo = lo.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let hi = lo.rotate_left(29) ^ 0x9e37_79b9_7f4a_7c15;
    let mut uuid = [0u8; 16];
    uuid[..8].copy_from_slice(&lo.to_le_bytes());
    uuid[8..].copy_from_slice(&hi.to_le_bytes());
    uuid
}
