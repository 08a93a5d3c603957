//! MSI 窗口重映射
//!
//! 设备上下文中的 `msi_addr_mask`/`msi_addr_pattern` 描述一个 IOVA 页窗口，
//! 落入窗口的访问按 MSI 写处理，不走普通页表。

use crate::context::DeviceContext;
use crate::error::{Fault, FaultCause};
use crate::{AccessFlags, PAGE_MASK, PAGE_SHIFT};

/// MSI 页表指针字段
pub mod msiptp {
    pub const VALID: u64 = 1 << 0;
    pub const PPN_MASK: u64 = 0x0FFF_FFFF_FFFF_FFFE;
    pub const MODE_SHIFT: u64 = 60;
}

/// MSI 页表模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsiMode {
    /// 直通
    Bare = 0,
    /// 平坦 MSI 页表（未实现）
    Flat = 1,
}

impl MsiMode {
    pub fn from_bits(mode: u64) -> Option<Self> {
        match mode {
            0 => Some(MsiMode::Bare),
            1 => Some(MsiMode::Flat),
            _ => None,
        }
    }
}

/// MSI 重映射结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiMapping {
    pub translated_addr: u64,
    pub addr_mask: u64,
}

/// IOVA 是否落入设备的 MSI 窗口
///
/// 掩码中置 1 的页号位不参与比较。
pub fn in_window(dc: &DeviceContext, iova: u64) -> bool {
    ((iova >> PAGE_SHIFT) ^ dc.msi_addr_pattern) & !dc.msi_addr_mask == 0
}

/// 重映射窗口内的访问
pub fn remap(dc: &DeviceContext, iova: u64, access: AccessFlags) -> Result<MsiMapping, Fault> {
    // 只允许写
    if access != AccessFlags::WriteOnly {
        return Err(Fault::new(FaultCause::MrifFault));
    }
    if iova & PAGE_MASK != 0 {
        return Err(Fault::new(FaultCause::MrifFault));
    }
    if dc.msiptp & msiptp::VALID == 0 {
        return Err(Fault::new(FaultCause::DdtInvalid));
    }

    match MsiMode::from_bits(dc.msiptp >> msiptp::MODE_SHIFT) {
        Some(MsiMode::Bare) => Ok(MsiMapping {
            translated_addr: iova,
            addr_mask: PAGE_MASK,
        }),
        // 平坦 MSI 页表（中断文件重映射）未实现
        Some(MsiMode::Flat) | None => Err(Fault::new(FaultCause::DdtUnsupported)),
    }
}
