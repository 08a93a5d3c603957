//! 寄存器文件
//!
//! 字节寻址的寄存器块，每个字节有三组并行掩码：
//! - `rw`：当前值
//! - `ro`：只读位，客户机写入被丢弃
//! - `wc`：写 1 清零位
//!
//! 客户机写入统一走 [`RegisterFile::guest_write`]：
//! `new = ((old & ro) | (val & !ro)) & !(val & wc)`。

/// 寄存器窗口大小（BAR0 中的 MMIO 区域）
pub const REG_WINDOW_SIZE: usize = 0x1000;

// ============================================================================
// 寄存器偏移
// ============================================================================

pub const REG_CAP: u64 = 0x0000;
pub const REG_DDTP: u64 = 0x0010;
pub const REG_CQ_BASE: u64 = 0x0018;
pub const REG_CQ_HEAD: u64 = 0x0020;
pub const REG_CQ_TAIL: u64 = 0x0024;
pub const REG_FQ_BASE: u64 = 0x0028;
pub const REG_FQ_HEAD: u64 = 0x0030;
pub const REG_FQ_TAIL: u64 = 0x0034;
pub const REG_PQ_BASE: u64 = 0x0038;
pub const REG_PQ_HEAD: u64 = 0x0040;
pub const REG_PQ_TAIL: u64 = 0x0044;
pub const REG_CQ_CONTROL: u64 = 0x0048;
pub const REG_FQ_CONTROL: u64 = 0x004C;
pub const REG_PQ_CONTROL: u64 = 0x0050;
pub const REG_IPSR: u64 = 0x0054;
pub const REG_IVEC: u64 = 0x02F8;
pub const REG_MSI_ADDR_BASE: u64 = 0x0300;
pub const REG_MSI_DATA_BASE: u64 = 0x0308;
pub const REG_MSI_CTRL_BASE: u64 = 0x030C;
pub const REG_MSI_PBA_BASE: u64 = 0x0400;

/// 每个 MSI 向量表项的跨度
pub const MSI_VECTOR_STRIDE: u64 = 16;
/// MSI 向量数（每个中断源一个）
pub const MSI_VECTOR_COUNT: u32 = 4;

/// 编程接口版本
pub const CAP_REVISION: u32 = 0x0002;

/// 能力寄存器位
pub mod cap {
    pub const REVISION_MASK: u64 = 0x00FF;
    pub const STAGE_ONE: u64 = 1 << 8;
    pub const STAGE_TWO: u64 = 1 << 9;
    pub const MSI: u64 = 1 << 10;
    pub const MRIF: u64 = 1 << 11;
    pub const ATS: u64 = 1 << 12;
    pub const AMO: u64 = 1 << 13;
}

/// 设备目录表指针
pub mod ddtp {
    pub const BUSY: u64 = 1 << 59;
    pub const PPN_MASK: u64 = 0x0000_0FFF_FFFF_FFFF;
    pub const MODE_SHIFT: u64 = 60;
    pub const MODE_MASK: u64 = 0xF000_0000_0000_0000;
    /// 非叶子目录项中的页地址
    pub const DDTE_PPN_MASK: u64 = 0x00FF_FFFF_FFFF_F000;
}

/// 队列基址寄存器（CQ/FQ/PQ 共用格式）
pub mod queue_base {
    pub const LOG2SZ_MASK: u64 = 0x0000_0000_0000_001F;
    pub const PPN_MASK: u64 = 0x0001_FFFF_FFFF_FFE0;
    pub const PPN_SHIFT: u64 = 5;
}

/// 命令队列控制/状态寄存器
pub mod cq_ctrl {
    pub const ENABLE: u32 = 1 << 0;
    pub const IRQ_ENABLE: u32 = 1 << 1;
    pub const FAULT: u32 = 1 << 8;
    pub const TIMEOUT: u32 = 1 << 9;
    pub const ERROR: u32 = 1 << 10;
    pub const ACTIVE: u32 = 1 << 16;
    pub const BUSY: u32 = 1 << 17;
}

/// 故障队列控制/状态寄存器
pub mod fq_ctrl {
    pub const ENABLE: u32 = 1 << 0;
    pub const IRQ_ENABLE: u32 = 1 << 1;
    pub const FAULT: u32 = 1 << 8;
    pub const FULL: u32 = 1 << 9;
    pub const ACTIVE: u32 = 1 << 16;
    pub const BUSY: u32 = 1 << 17;
}

/// 页请求队列控制/状态寄存器
pub mod pq_ctrl {
    pub const ENABLE: u32 = 1 << 0;
    pub const IRQ_ENABLE: u32 = 1 << 1;
    pub const FAULT: u32 = 1 << 8;
    pub const FULL: u32 = 1 << 9;
    pub const ACTIVE: u32 = 1 << 16;
    pub const BUSY: u32 = 1 << 17;
}

/// MSI 向量控制寄存器
pub mod msi_ctrl {
    pub const MASKED: u32 = 1 << 0;
}

/// 客户机写入的附带效果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteEffect {
    /// 普通寄存器写入
    None,
    /// 置位 `reg` 中的忙位 `mask`，并唤醒核心线程
    Busy { reg: u64, mask: u64 },
    /// 命令队列尾指针门铃
    Doorbell,
    /// MSI 向量控制寄存器被改写
    VectorControl(u32),
}

// 带忙位副作用的寄存器：(偏移, 宽度, 忙位)
const BUSY_REGS: [(u64, u64, u64); 4] = [
    (REG_DDTP, 8, ddtp::BUSY),
    (REG_CQ_CONTROL, 4, cq_ctrl::BUSY as u64),
    (REG_FQ_CONTROL, 4, fq_ctrl::BUSY as u64),
    (REG_PQ_CONTROL, 4, pq_ctrl::BUSY as u64),
];

fn overlaps(offset: u64, size: u64, reg: u64, width: u64) -> bool {
    offset < reg + width && reg < offset + size
}

/// 计算客户机写入 `[offset, offset + size)` 的附带效果
pub fn write_effect(offset: u64, size: u64) -> WriteEffect {
    if let Some(&(reg, _, mask)) = BUSY_REGS
        .iter()
        .find(|(reg, width, _)| overlaps(offset, size, *reg, *width))
    {
        return WriteEffect::Busy { reg, mask };
    }
    if overlaps(offset, size, REG_CQ_TAIL, 4) {
        return WriteEffect::Doorbell;
    }
    let table_end = REG_MSI_ADDR_BASE + u64::from(MSI_VECTOR_COUNT) * MSI_VECTOR_STRIDE;
    if (REG_MSI_ADDR_BASE..table_end).contains(&offset) {
        let vector = ((offset - REG_MSI_ADDR_BASE) / MSI_VECTOR_STRIDE) as u32;
        let ctrl = REG_MSI_CTRL_BASE + u64::from(vector) * MSI_VECTOR_STRIDE;
        if overlaps(offset, size, ctrl, 4) {
            return WriteEffect::VectorControl(vector);
        }
    }
    WriteEffect::None
}

fn width_mask(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (size * 8)) - 1
    }
}

fn load_le(bytes: &[u8], offset: usize, size: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf[..size].copy_from_slice(&bytes[offset..offset + size]);
    u64::from_le_bytes(buf)
}

fn store_le(bytes: &mut [u8], offset: usize, size: usize, val: u64) {
    bytes[offset..offset + size].copy_from_slice(&val.to_le_bytes()[..size]);
}

/// 访问是否合法：1/2/4/8 字节且完整落在寄存器窗口内
pub fn valid_access(offset: u64, size: u8) -> bool {
    matches!(size, 1 | 2 | 4 | 8)
        && offset
            .checked_add(u64::from(size))
            .is_some_and(|end| end <= REG_WINDOW_SIZE as u64)
}

/// 寄存器文件：三组等长字节数组
pub struct RegisterFile {
    rw: Box<[u8]>,
    ro: Box<[u8]>,
    wc: Box<[u8]>,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile {
    /// 创建全零寄存器文件（未复位）
    pub fn new() -> Self {
        Self {
            rw: vec![0u8; REG_WINDOW_SIZE].into_boxed_slice(),
            ro: vec![0u8; REG_WINDOW_SIZE].into_boxed_slice(),
            wc: vec![0u8; REG_WINDOW_SIZE].into_boxed_slice(),
        }
    }

    /// 上电复位：写入能力寄存器并建立 RO/WC 掩码
    pub fn reset(&mut self, capabilities: u64) {
        self.rw.fill(0);
        self.wc.fill(0);
        // 默认全部只读
        self.ro.fill(0xff);

        self.store_q(REG_CAP, capabilities);
        self.set_ro_q(REG_DDTP, !(ddtp::PPN_MASK | ddtp::MODE_MASK));
        for base in [REG_CQ_BASE, REG_FQ_BASE, REG_PQ_BASE] {
            self.set_ro_q(base, !(queue_base::LOG2SZ_MASK | queue_base::PPN_MASK));
        }
        // 状态位写 1 清零；ACTIVE/BUSY 只由核心线程修改
        self.set_wc_l(REG_CQ_CONTROL, cq_ctrl::FAULT | cq_ctrl::TIMEOUT | cq_ctrl::ERROR);
        self.set_ro_l(REG_CQ_CONTROL, cq_ctrl::ACTIVE | cq_ctrl::BUSY);
        self.set_wc_l(REG_FQ_CONTROL, fq_ctrl::FAULT | fq_ctrl::FULL);
        self.set_ro_l(REG_FQ_CONTROL, fq_ctrl::ACTIVE | fq_ctrl::BUSY);
        self.set_wc_l(REG_PQ_CONTROL, pq_ctrl::FAULT | pq_ctrl::FULL);
        self.set_ro_l(REG_PQ_CONTROL, pq_ctrl::ACTIVE | pq_ctrl::BUSY);
        self.set_wc_l(REG_IPSR, !0);

        // 4 个中断源，每个 4 位向量号
        self.set_ro_l(REG_IVEC, !0xffff);
        for vector in 0..MSI_VECTOR_COUNT {
            let stride = u64::from(vector) * MSI_VECTOR_STRIDE;
            self.set_ro_q(REG_MSI_ADDR_BASE + stride, 0);
            self.set_ro_l(REG_MSI_DATA_BASE + stride, 0);
            self.set_ro_l(REG_MSI_CTRL_BASE + stride, !msi_ctrl::MASKED);
        }
    }

    /// 客户机读；非法访问返回 `None`
    pub fn guest_read(&self, offset: u64, size: u8) -> Option<u64> {
        valid_access(offset, size).then(|| load_le(&self.rw, offset as usize, size as usize))
    }

    /// 客户机写（掩码读-改-写）；非法访问返回 `false` 并被忽略
    pub fn guest_write(&mut self, offset: u64, val: u64, size: u8) -> bool {
        if !valid_access(offset, size) {
            return false;
        }
        let (off, len) = (offset as usize, size as usize);
        let mask = width_mask(len);
        let val = val & mask;
        let rw = load_le(&self.rw, off, len);
        let ro = load_le(&self.ro, off, len);
        let wc = load_le(&self.wc, off, len);
        let new = ((rw & ro) | (val & !ro)) & !(val & wc);
        store_le(&mut self.rw, off, len, new & mask);
        true
    }

    /// 设备侧读-改-写：置位 `set`、清除 `clr`，返回旧值
    pub fn modify_l(&mut self, offset: u64, set: u32, clr: u32) -> u32 {
        let val = self.load_l(offset);
        self.store_l(offset, set | (val & !clr));
        val
    }

    pub fn load_l(&self, offset: u64) -> u32 {
        load_le(&self.rw, offset as usize, 4) as u32
    }

    pub fn load_q(&self, offset: u64) -> u64 {
        load_le(&self.rw, offset as usize, 8)
    }

    pub fn store_l(&mut self, offset: u64, val: u32) {
        store_le(&mut self.rw, offset as usize, 4, u64::from(val));
    }

    pub fn store_q(&mut self, offset: u64, val: u64) {
        store_le(&mut self.rw, offset as usize, 8, val);
    }

    /// 设置 64 位寄存器中的忙位（设备侧，不受 RO 掩码约束）
    pub fn set_bits_q(&mut self, offset: u64, bits: u64) {
        let val = self.load_q(offset);
        self.store_q(offset, val | bits);
    }

    pub fn set_ro_l(&mut self, offset: u64, mask: u32) {
        store_le(&mut self.ro, offset as usize, 4, u64::from(mask));
    }

    pub fn set_ro_q(&mut self, offset: u64, mask: u64) {
        store_le(&mut self.ro, offset as usize, 8, mask);
    }

    pub fn set_wc_l(&mut self, offset: u64, mask: u32) {
        store_le(&mut self.wc, offset as usize, 4, u64::from(mask));
    }
}
