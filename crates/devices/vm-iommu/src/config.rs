//! IOMMU 设备配置
//!
//! 对应设备属性：编程接口版本、MSI 重映射、stage-one / stage-two 支持。

use serde::{Deserialize, Serialize};

use crate::error::{IommuError, IommuResult};
use crate::regs::{CAP_REVISION, cap};

/// IOMMU 配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IommuConfig {
    /// 编程接口版本（能力寄存器低 8 位）
    pub version: u32,
    /// MSI 重映射支持，同时决定设备上下文使用 64 字节扩展格式
    pub msi: bool,
    /// stage-one 转换支持
    pub stage_one: bool,
    /// stage-two 转换支持
    pub stage_two: bool,
}

impl Default for IommuConfig {
    fn default() -> Self {
        Self {
            version: CAP_REVISION,
            msi: cfg!(feature = "msi"),
            stage_one: true,
            stage_two: cfg!(feature = "stage-two"),
        }
    }
}

impl IommuConfig {
    /// 验证配置的有效性
    pub fn validate(&self) -> IommuResult<()> {
        if u64::from(self.version) & !cap::REVISION_MASK != 0 {
            return Err(IommuError::ConfigError(format!(
                "version {:#x} does not fit the 8-bit revision field",
                self.version
            )));
        }
        Ok(())
    }

    /// 能力寄存器复位值
    pub fn capabilities(&self) -> u64 {
        let mut caps = u64::from(self.version) & cap::REVISION_MASK;
        if self.stage_one {
            caps |= cap::STAGE_ONE;
        }
        if self.stage_two {
            caps |= cap::STAGE_TWO;
        }
        if self.msi {
            caps |= cap::MSI;
        }
        caps
    }

    /// 从 TOML 字符串加载配置
    pub fn from_toml(toml: &str) -> IommuResult<Self> {
        let config: Self = toml::from_str(toml)
            .map_err(|e| IommuError::ConfigParse(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// 将配置序列化为 TOML
    pub fn to_toml(&self) -> IommuResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| IommuError::ConfigSerialize(format!("TOML serialize error: {}", e)))
    }
}
