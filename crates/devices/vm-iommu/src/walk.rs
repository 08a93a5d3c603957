// 页表遍历（Page-Table Walker）实现
//
// 实现两级地址转换：
// - Stage 1：IOVA -> GPA（satp）
// - Stage 2：GPA -> SPA（gatp），顶层索引加宽 2 位
// - Stage 1 每一级的输出地址都经过 Stage 2 转换

use crate::AccessFlags;
use crate::error::{Fault, FaultCause};
use crate::memory::GuestMemory;
use crate::{PAGE_MASK, PAGE_SHIFT};

/// ATP 字段
pub mod atp {
    pub const PPN_MASK: u64 = 0x0000_0FFF_FFFF_FFFF;
    pub const ASID_SHIFT: u64 = 44;
    pub const ASID_MASK: u64 = 0x0FFF_F000_0000_0000;
    pub const MODE_SHIFT: u64 = 60;
}

/// 页表项位
pub mod pte {
    pub const V: u64 = 1 << 0;
    pub const R: u64 = 1 << 1;
    pub const W: u64 = 1 << 2;
    pub const X: u64 = 1 << 3;
    pub const U: u64 = 1 << 4;
    pub const G: u64 = 1 << 5;
    pub const A: u64 = 1 << 6;
    pub const D: u64 = 1 << 7;
    pub const RWX: u64 = R | W | X;
    pub const PPN_SHIFT: u64 = 10;
}

/// 地址转换模式（ATP.MODE）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AtpMode {
    /// 不转换
    Bare = 0,
    Sv32 = 1,
    Sv39 = 8,
    Sv48 = 9,
    Sv57 = 10,
}

impl AtpMode {
    /// 从 MODE 字段解析
    pub fn from_bits(mode: u64) -> Option<Self> {
        match mode {
            0 => Some(AtpMode::Bare),
            1 => Some(AtpMode::Sv32),
            8 => Some(AtpMode::Sv39),
            9 => Some(AtpMode::Sv48),
            10 => Some(AtpMode::Sv57),
            _ => None,
        }
    }

    /// 页表几何参数；BARE 返回 `None`
    pub fn geometry(self) -> Option<PageTableGeometry> {
        let (levels, index_bits, pte_size) = match self {
            AtpMode::Bare => return None,
            AtpMode::Sv32 => (2, 10, 4),
            AtpMode::Sv39 => (3, 9, 8),
            AtpMode::Sv48 => (4, 9, 8),
            AtpMode::Sv57 => (5, 9, 8),
        };
        Some(PageTableGeometry {
            levels,
            index_bits,
            pte_size,
        })
    }
}

/// 页表几何参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableGeometry {
    /// 页表层数
    pub levels: u32,
    /// 每级索引位宽
    pub index_bits: u32,
    /// 页表项字节数
    pub pte_size: u64,
}

/// 构造 ATP 值
pub fn make_atp(mode: AtpMode, asid: u16, root: u64) -> u64 {
    ((mode as u64) << atp::MODE_SHIFT)
        | ((u64::from(asid) << atp::ASID_SHIFT) & atp::ASID_MASK)
        | ((root >> PAGE_SHIFT) & atp::PPN_MASK)
}

/// 解析 ATP 的模式字段（原始值）
pub fn atp_mode_bits(atp: u64) -> u64 {
    atp >> atp::MODE_SHIFT
}

/// ATP 根页表物理地址
pub fn atp_root(atp: u64) -> u64 {
    (atp & atp::PPN_MASK) << PAGE_SHIFT
}

/// 构造页表项
pub fn make_pte(addr: u64, flags: u64) -> u64 {
    ((addr >> PAGE_SHIFT) << pte::PPN_SHIFT) | flags | pte::V
}

/// 转换阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationStage {
    /// Stage 1：IOVA 到 GPA
    Stage1,
    /// Stage 2：GPA 到 SPA
    Stage2,
}

/// 两级页表遍历器
pub struct PageTableWalker<'a> {
    mem: &'a dyn GuestMemory,
    /// stage-two 地址转换指针
    gatp: u64,
    /// stage-one 地址转换指针
    satp: u64,
}

impl<'a> PageTableWalker<'a> {
    pub fn new(mem: &'a dyn GuestMemory, gatp: u64, satp: u64) -> Self {
        Self { mem, gatp, satp }
    }

    /// 执行地址转换
    ///
    /// # 参数
    /// - `iova`: 输入地址
    /// - `stage`: 起始阶段；`Stage1` 时结果再经过 stage-two
    /// - `access`: 请求的访问权限
    ///
    /// # 返回
    /// - `Ok(pa)`: 转换后的物理地址
    /// - `Err(fault)`: 故障；stage-two 失败时 `phys` 为引起故障的 GPA
    pub fn translate(
        &self,
        iova: u64,
        stage: TranslationStage,
        access: AccessFlags,
    ) -> Result<u64, Fault> {
        let atp = match stage {
            TranslationStage::Stage1 => self.satp,
            TranslationStage::Stage2 => self.gatp,
        };

        let mode = AtpMode::from_bits(atp_mode_bits(atp))
            .ok_or_else(|| Fault::new(FaultCause::DdtUnsupported))?;
        let Some(geometry) = mode.geometry() else {
            return match stage {
                TranslationStage::Stage1 => self.translate(iova, TranslationStage::Stage2, access),
                TranslationStage::Stage2 => Ok(iova),
            };
        };

        let PageTableGeometry {
            levels,
            index_bits,
            pte_size,
        } = geometry;
        let mut widened = match stage {
            TranslationStage::Stage1 => 0,
            TranslationStage::Stage2 => 2,
        };

        // 高位必须为零
        let va_bits = PAGE_SHIFT as u32 + levels * index_bits + widened;
        if iova >> va_bits != 0 {
            return Err(Fault::new(FaultCause::DmaDisabled));
        }

        let mut base = atp_root(atp);
        let mut ptshift = (levels - 1) * index_bits;
        for _ in 0..levels {
            let idx = (iova >> (PAGE_SHIFT as u32 + ptshift)) & ((1u64 << (index_bits + widened)) - 1);
            let pte_addr = base.wrapping_add(idx * pte_size);
            widened = 0;

            let entry = self
                .read_pte(pte_addr, pte_size)
                .map_err(|_| Fault::new(FaultCause::PdtFault))?;
            let ppn = entry >> pte::PPN_SHIFT;
            let leaf = entry & pte::RWX != 0;

            if entry & pte::V == 0 {
                return Err(Fault::new(FaultCause::PdtInvalid));
            }
            if !leaf {
                base = ppn << PAGE_SHIFT;
            } else {
                Self::check_leaf(entry, ppn, ptshift, stage, access)?;
                let vpn = iova >> PAGE_SHIFT;
                base = ((ppn | (vpn & ((1u64 << ptshift) - 1))) << PAGE_SHIFT) | (iova & PAGE_MASK);
            }

            // stage-one 每一级输出都是 GPA
            if stage == TranslationStage::Stage1 {
                base = self
                    .translate(base, TranslationStage::Stage2, access)
                    .map_err(|fault| fault.with_phys(base))?;
            }

            if leaf {
                return Ok(base);
            }
            ptshift = ptshift.saturating_sub(index_bits);
        }

        Err(Fault::new(FaultCause::PdtInvalid))
    }

    fn read_pte(&self, addr: u64, size: u64) -> crate::IommuResult<u64> {
        if size == 4 {
            self.mem.read_u32(addr).map(u64::from)
        } else {
            self.mem.read_u64(addr)
        }
    }

    // 叶子项合法性与权限检查
    fn check_leaf(
        entry: u64,
        ppn: u64,
        ptshift: u32,
        stage: TranslationStage,
        access: AccessFlags,
    ) -> Result<(), Fault> {
        let rwx = entry & pte::RWX;
        // 保留组合
        if rwx == pte::W || rwx == pte::W | pte::X {
            return Err(Fault::new(FaultCause::PdtInvalid));
        }
        // 大页 PPN 未对齐
        if ppn & ((1u64 << ptshift) - 1) != 0 {
            return Err(Fault::new(FaultCause::PdtInvalid));
        }
        let first = stage == TranslationStage::Stage1;
        if access.is_read() && entry & pte::R == 0 {
            return Err(Fault::new(if first {
                FaultCause::GuestPageFaultRead
            } else {
                FaultCause::PageFaultRead
            }));
        }
        if access.is_write() && entry & pte::W == 0 {
            return Err(Fault::new(if first {
                FaultCause::GuestPageFaultWrite
            } else {
                FaultCause::PageFaultWrite
            }));
        }
        Ok(())
    }
}
