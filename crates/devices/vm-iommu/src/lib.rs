// RISC-V IOMMU 设备模拟
//
// 本模块实现挂接在虚拟 PCI 总线上的 IOMMU（RIVOS 编程接口），包括：
// - 寄存器文件（RW/RO/WC 掩码写语义）
// - 设备目录表（DDT）遍历
// - 两级（stage-one / stage-two）页表遍历
// - MSI 窗口重映射
// - 命令队列处理线程
// - 故障队列上报

pub mod command;
pub mod config;
pub mod context;
pub mod device;
pub mod error;
pub mod fault;
pub mod interrupt;
pub mod memory;
pub mod msi;
pub mod queue;
pub mod regs;
pub mod stats;
pub mod walk;

// 重新导出主要类型
pub use command::{Command, Opcode};
pub use config::IommuConfig;
pub use context::{DdtMode, DeviceContext, DeviceId};
pub use device::{DeviceSpace, IommuDevice, IommuMemoryRegion, IotlbEntry, NotifierFlags};
pub use error::{Fault, FaultCause, IommuError, IommuResult, TransactionType};
pub use fault::FaultRecord;
pub use interrupt::{InterruptSink, InterruptSource, MsiMessage};
pub use memory::{GuestMemory, GuestRam};
pub use stats::IommuStats;
pub use walk::AtpMode;

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 库描述
pub const DESCRIPTION: &str = "RISC-V IOMMU emulation for PCI DMA remapping";

/// PCI 厂商 ID（Rivos Inc.）
pub const PCI_VENDOR_ID_RIVOS: u16 = 0x1efd;
/// PCI 设备 ID
pub const PCI_DEVICE_ID_RIVOS_IOMMU: u16 = 0x8001;
/// PCI class code: base class 0x08 (system peripheral), sub-class 0x06 (IOMMU)
pub const PCI_CLASS_SYSTEM_IOMMU: u16 = 0x0806;

/// 页大小位偏移
pub const PAGE_SHIFT: u64 = 12;
/// 页大小：4KB
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
/// 页内偏移掩码
pub const PAGE_MASK: u64 = PAGE_SIZE - 1;

/// 访问权限（IOMMU 访问标志）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccessFlags {
    /// 无权限（转换失败）
    #[default]
    None = 0,
    /// 只读
    ReadOnly = 1 << 0,
    /// 只写
    WriteOnly = 1 << 1,
    /// 读写
    ReadWrite = 1 << 0 | 1 << 1,
}

impl AccessFlags {
    /// 是否包含读权限
    pub fn is_read(self) -> bool {
        self as u8 & AccessFlags::ReadOnly as u8 != 0
    }

    /// 是否包含写权限
    pub fn is_write(self) -> bool {
        self as u8 & AccessFlags::WriteOnly as u8 != 0
    }

    /// 简短名称，用于日志
    pub fn as_str(self) -> &'static str {
        match self {
            AccessFlags::None => "NA",
            AccessFlags::ReadOnly => "RO",
            AccessFlags::WriteOnly => "WR",
            AccessFlags::ReadWrite => "RW",
        }
    }
}

/// PCI requester ID 辅助函数（bus:8 | devfn:8）
pub fn pci_build_bdf(bus: u8, devfn: u8) -> u32 {
    (u32::from(bus) << 8) | u32::from(devfn)
}

/// 从 requester ID 取出 bus 号
pub fn pci_bus_num(bdf: u32) -> u8 {
    ((bdf >> 8) & 0xff) as u8
}

/// 从 requester ID 取出 slot 号
pub fn pci_slot(bdf: u32) -> u8 {
    ((bdf >> 3) & 0x1f) as u8
}

/// 从 requester ID 取出 function 号
pub fn pci_func(bdf: u32) -> u8 {
    (bdf & 0x07) as u8
}
