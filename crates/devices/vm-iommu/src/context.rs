//! 设备目录表（DDT）与设备上下文
//!
//! 设备 ID 经 0~2 级非叶子目录表索引到叶子页中的设备上下文。
//! 非叶子表每页 512 项（9 位索引），叶子页中设备上下文为 64 字节
//! （扩展格式，启用 MSI 重映射时）或 32 字节（基本格式）。

use std::fmt;

use crate::error::{Fault, FaultCause};
use crate::memory::GuestMemory;
use crate::regs::ddtp;
use crate::{PAGE_MASK, PAGE_SHIFT};

/// 设备 ID 最大位宽
pub const DEVICE_ID_BITS: u32 = 24;
/// 非叶子目录表索引位宽
const NON_LEAF_INDEX_BITS: u32 = 9;
/// 叶子目录表索引位宽（扩展格式）
const LEAF_INDEX_BITS: u32 = 6;

/// 设备 ID，对 PCI 设备即 requester ID（B/D/F）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u32);

impl DeviceId {
    /// 从原始值创建，超出 24 位返回 `None`
    pub fn new(val: u32) -> Option<Self> {
        (val >> DEVICE_ID_BITS == 0).then_some(Self(val))
    }

    /// 由 PCI bus 号和 devfn 构造
    pub fn from_bdf(bus: u8, devfn: u8) -> Self {
        Self(crate::pci_build_bdf(bus, devfn))
    }

    /// 原始值
    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}.{}",
            self.0 >> 8,
            crate::pci_slot(self.0),
            crate::pci_func(self.0)
        )
    }
}

/// 设备目录表模式（DDTP.MODE）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DdtMode {
    /// 所有 DMA 被禁止（上电状态）
    #[default]
    Off = 0,
    /// 全局直通
    Bare = 1,
    /// 三级目录表
    ThreeLevel = 2,
    /// 两级目录表
    TwoLevel = 3,
    /// 一级目录表
    OneLevel = 4,
}

impl DdtMode {
    /// 从 MODE 字段解析
    pub fn from_bits(mode: u64) -> Option<Self> {
        match mode {
            0 => Some(DdtMode::Off),
            1 => Some(DdtMode::Bare),
            2 => Some(DdtMode::ThreeLevel),
            3 => Some(DdtMode::TwoLevel),
            4 => Some(DdtMode::OneLevel),
            _ => None,
        }
    }

    pub fn bits(self) -> u64 {
        self as u64
    }

    /// 非叶子目录层数；OFF/BARE 不走目录表
    pub fn depth(self) -> Option<u32> {
        match self {
            DdtMode::OneLevel => Some(0),
            DdtMode::TwoLevel => Some(1),
            DdtMode::ThreeLevel => Some(2),
            DdtMode::Off | DdtMode::Bare => None,
        }
    }

    /// 是否通过目录表转换
    pub fn is_directory(self) -> bool {
        self.depth().is_some()
    }

    /// DDTP 模式迁移规则：
    /// `{OFF, BARE} -> {OFF, BARE, 1LVL, 2LVL, 3LVL}`，
    /// `{1LVL, 2LVL, 3LVL} -> {OFF, BARE}`，以及保持不变。
    pub fn can_transition_to(self, next: DdtMode) -> bool {
        self == next || !self.is_directory() || !next.is_directory()
    }
}

/// 设备上下文 `tc` 字段位
pub mod tc {
    pub const VALID: u64 = 1 << 0;
    pub const EN_ATS: u64 = 1 << 1;
    pub const EN_PRI: u64 = 1 << 2;
    pub const T2GPA: u64 = 1 << 3;
    pub const DIS_TRANS_FAULT: u64 = 1 << 4;
    pub const PDTV: u64 = 1 << 5;
}

/// 设备上下文（64 字节，小端）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceContext {
    /// 转换控制
    pub tc: u64,
    /// stage-two 地址转换指针
    pub gatp: u64,
    /// stage-one 地址转换指针或进程目录指针
    pub satp: u64,
    /// 进程软上下文 ID
    pub pscid: u64,
    /// MSI 页表指针
    pub msiptp: u64,
    pub msi_addr_mask: u64,
    pub msi_addr_pattern: u64,
    pub reserved: u64,
}

impl DeviceContext {
    /// 扩展格式大小
    pub const SIZE: usize = 64;
    /// 基本格式大小（无 MSI 字段）
    pub const BASE_SIZE: usize = 32;

    /// 从小端字节解析；短于 64 字节时其余字段为 0
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; Self::SIZE];
        let len = bytes.len().min(Self::SIZE);
        buf[..len].copy_from_slice(&bytes[..len]);
        let field = |i: usize| {
            let mut word = [0u8; 8];
            word.copy_from_slice(&buf[i * 8..i * 8 + 8]);
            u64::from_le_bytes(word)
        };
        Self {
            tc: field(0),
            gatp: field(1),
            satp: field(2),
            pscid: field(3),
            msiptp: field(4),
            msi_addr_mask: field(5),
            msi_addr_pattern: field(6),
            reserved: field(7),
        }
    }

    /// 序列化为小端字节
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let fields = [
            self.tc,
            self.gatp,
            self.satp,
            self.pscid,
            self.msiptp,
            self.msi_addr_mask,
            self.msi_addr_pattern,
            self.reserved,
        ];
        let mut bytes = [0u8; Self::SIZE];
        for (chunk, field) in bytes.chunks_exact_mut(8).zip(fields) {
            chunk.copy_from_slice(&field.to_le_bytes());
        }
        bytes
    }

    pub fn valid(&self) -> bool {
        self.tc & tc::VALID != 0
    }

    pub fn ats_enabled(&self) -> bool {
        self.tc & tc::EN_ATS != 0
    }

    pub fn pri_enabled(&self) -> bool {
        self.tc & tc::EN_PRI != 0
    }

    pub fn t2gpa(&self) -> bool {
        self.tc & tc::T2GPA != 0
    }

    /// 是否禁止上报转换故障
    pub fn fault_disabled(&self) -> bool {
        self.tc & tc::DIS_TRANS_FAULT != 0
    }

    /// `satp` 是否为进程目录表指针
    pub fn pdt_valid(&self) -> bool {
        self.tc & tc::PDTV != 0
    }
}

/// 设备目录表
#[derive(Debug, Clone, Copy)]
pub struct DirectoryTable {
    /// 根目录表物理地址（页对齐）
    pub base: u64,
    /// 目录表模式
    pub mode: DdtMode,
    /// 是否使用 64 字节扩展设备上下文
    pub extended: bool,
}

impl DirectoryTable {
    pub fn new(base: u64, mode: DdtMode, extended: bool) -> Self {
        Self {
            base,
            mode,
            extended,
        }
    }

    /// 设备上下文跨度
    pub fn context_size(&self) -> usize {
        if self.extended {
            DeviceContext::SIZE
        } else {
            DeviceContext::BASE_SIZE
        }
    }

    /// 当前深度下可表示的设备 ID 位宽
    ///
    /// 基本格式叶子页多一位索引；三级表时最高层索引受 24 位设备 ID 限制。
    pub fn device_id_bits(&self) -> Option<u32> {
        let depth = self.mode.depth()?;
        let narrow = u32::from(!self.extended && depth != 2);
        Some(depth * NON_LEAF_INDEX_BITS + LEAF_INDEX_BITS + narrow)
    }

    /// 遍历目录表，取出 `devid` 的设备上下文
    pub fn fetch(&self, mem: &dyn GuestMemory, devid: u32) -> Result<DeviceContext, Fault> {
        let (Some(mut depth), Some(id_bits)) = (self.mode.depth(), self.device_id_bits()) else {
            return Err(Fault::new(FaultCause::DdtUnsupported));
        };

        if u64::from(devid) >> id_bits != 0 {
            return Err(Fault::new(FaultCause::DdtInvalid));
        }

        let leaf_shift = LEAF_INDEX_BITS + u32::from(!self.extended);
        let mut addr = self.base;
        while depth > 0 {
            depth -= 1;
            let split = depth * NON_LEAF_INDEX_BITS + leaf_shift;
            addr |= ((u64::from(devid) >> split) << 3) & PAGE_MASK;
            let dde = mem
                .read_u64(addr)
                .map_err(|_| Fault::new(FaultCause::DdtFault))?;
            if dde & tc::VALID == 0 {
                return Err(Fault::new(FaultCause::DdtInvalid));
            }
            addr = dde & ddtp::DDTE_PPN_MASK;
        }

        // 叶子页内索引
        let size = self.context_size();
        addr |= (u64::from(devid) * size as u64) & PAGE_MASK;

        let mut bytes = [0u8; DeviceContext::SIZE];
        mem.read(addr, &mut bytes[..size])
            .map_err(|_| Fault::new(FaultCause::DdtFault))?;
        let dc = DeviceContext::from_bytes(&bytes[..size]);
        if !dc.valid() {
            return Err(Fault::new(FaultCause::DdtInvalid));
        }
        Ok(dc)
    }
}

/// 构造非叶子目录项
pub fn directory_entry(next_table: u64) -> u64 {
    (((next_table >> PAGE_SHIFT) << PAGE_SHIFT) & ddtp::DDTE_PPN_MASK) | tc::VALID
}
