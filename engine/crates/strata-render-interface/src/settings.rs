use std::fs;
use std::path::Path;

use anyhow::Context;
use ash::vk;
use serde::{Deserialize, Serialize};

/// uniform arena 的配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaSettings {
    /// arena 第一个 buffer 的大小，之后每次不够时翻倍
    pub initial_capacity: vk::DeviceSize,
}
impl Default for ArenaSettings {
    fn default() -> Self {
        Self { initial_capacity: 256 }
    }
}

/// descriptor pool 的配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptorPoolSettings {
    /// 第一个 pool 可以分配的 set 数量
    pub initial_sets: u32,
    /// 第一个 pool 中 descriptor 的数量
    pub initial_descriptors: u32,
}
impl Default for DescriptorPoolSettings {
    fn default() -> Self {
        Self {
            initial_sets: 2,
            initial_descriptors: 8,
        }
    }
}

/// 引擎配置，可以从 TOML 文件中加载，缺省的字段使用默认值
///
/// ```toml
/// frames_in_flight = 3
///
/// [arena]
/// initial_capacity = 256
///
/// [descriptor_pool]
/// initial_sets = 2
/// initial_descriptors = 8
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// 被替换下来的 buffer 需要等待多少帧才能销毁
    pub frames_in_flight: u64,
    pub arena: ArenaSettings,
    pub descriptor_pool: DescriptorPoolSettings,
}
impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            frames_in_flight: 3,
            arena: ArenaSettings::default(),
            descriptor_pool: DescriptorPoolSettings::default(),
        }
    }
}
impl EngineSettings {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let settings: EngineSettings = toml::from_str(content).context("解析 TOML 配置失败")?;
        settings.validate()?;
        Ok(settings)
    }

    /// 从 TOML 文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content =
            fs::read_to_string(path.as_ref()).with_context(|| format!("读取配置文件失败: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content).with_context(|| format!("加载配置失败: {:?}", path.as_ref()))
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("序列化配置失败")
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.frames_in_flight > 0, "frames_in_flight must be at least 1");
        anyhow::ensure!(self.arena.initial_capacity > 0, "arena.initial_capacity must be positive");
        anyhow::ensure!(
            self.descriptor_pool.initial_sets > 0 && self.descriptor_pool.initial_descriptors > 0,
            "descriptor_pool initial capacity must be positive"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.arena.initial_capacity, 256);
        assert_eq!(settings.descriptor_pool.initial_sets, 2);
        assert_eq!(settings.descriptor_pool.initial_descriptors, 8);
        assert_eq!(settings.frames_in_flight, 3);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let settings = EngineSettings::from_toml_str(
            r#"
            [arena]
            initial_capacity = 1024
            "#,
        )
        .unwrap();
        assert_eq!(settings.arena.initial_capacity, 1024);
        assert_eq!(settings.descriptor_pool, DescriptorPoolSettings::default());
        assert_eq!(settings.frames_in_flight, 3);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let settings = EngineSettings {
            frames_in_flight: 2,
            arena: ArenaSettings { initial_capacity: 4096 },
            descriptor_pool: DescriptorPoolSettings {
                initial_sets: 16,
                initial_descriptors: 64,
            },
        };
        let text = settings.to_toml_string().unwrap();
        assert_eq!(EngineSettings::from_toml_str(&text).unwrap(), settings);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(EngineSettings::from_toml_str("frames_in_flight = 0").is_err());
        assert!(EngineSettings::from_toml_str("[arena]\ninitial_capacity = 0").is_err());
        assert!(EngineSettings::from_toml_str("[arena]\ninitial_capacity = \"big\"").is_err());
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = EngineSettings::from_file("/definitely/not/here/strata.toml").unwrap_err();
        assert!(format!("{err:#}").contains("strata.toml"));
    }
}
