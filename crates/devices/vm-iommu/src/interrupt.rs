// 中断管理（Interrupt Management）实现
//
// 实现IOMMU的中断和MSI管理功能，包括：
// - 中断源到向量的映射（IVEC）
// - 中断挂起状态（IPSR）
// - MSI 向量表与挂起位数组（PBA）
// - 外部 MSI-X 通知接口

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::regs::{
    MSI_VECTOR_COUNT, MSI_VECTOR_STRIDE, REG_IPSR, REG_IVEC, REG_MSI_ADDR_BASE,
    REG_MSI_CTRL_BASE, REG_MSI_DATA_BASE, REG_MSI_PBA_BASE, RegisterFile, msi_ctrl,
};

/// 中断源，用于 IPSR 和 IVEC 索引
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptSource {
    /// 命令队列
    Cq = 0,
    /// 故障队列
    Fq = 1,
    /// 性能监控
    Pm = 2,
    /// 页请求队列
    Pq = 3,
}

impl InterruptSource {
    fn bit(self) -> u32 {
        1 << self as u32
    }
}

/// MSI消息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsiMessage {
    /// 向量号
    pub vector: u32,
    /// 目标地址
    pub address: u64,
    /// 数据字段
    pub data: u32,
}

/// 中断投递接口（由宿主环境提供的 MSI-X 通知原语）
pub trait InterruptSink: Send + Sync {
    /// 投递一条 MSI 消息
    fn notify(&self, message: MsiMessage);

    /// 平台是否启用了 MSI-X
    fn enabled(&self) -> bool {
        true
    }

    /// 标记向量被使用
    fn vector_use(&self, _vector: u32) {}

    /// 标记向量不再使用
    fn vector_unuse(&self, _vector: u32) {}
}

/// 读取中断源映射的向量号
pub fn irq_vector(regs: &RegisterFile, source: InterruptSource) -> u32 {
    (regs.load_l(REG_IVEC) >> (source as u32 * 4)) & 0x0f
}

fn vector_message(regs: &RegisterFile, vector: u32) -> MsiMessage {
    let stride = u64::from(vector) * MSI_VECTOR_STRIDE;
    MsiMessage {
        vector,
        address: regs.load_q(REG_MSI_ADDR_BASE + stride),
        data: regs.load_l(REG_MSI_DATA_BASE + stride),
    }
}

fn vector_masked(regs: &RegisterFile, vector: u32) -> bool {
    let stride = u64::from(vector) * MSI_VECTOR_STRIDE;
    regs.load_l(REG_MSI_CTRL_BASE + stride) & msi_ctrl::MASKED != 0
}

/// 置位中断源的 IPSR 位
///
/// 仅在 IPSR 位由 0 变 1 时产生消息；目标向量被屏蔽时改为置位 PBA。
/// 返回需要在释放核心锁后投递的消息。
pub fn assert_irq(regs: &mut RegisterFile, source: InterruptSource) -> Option<MsiMessage> {
    let ipsr = regs.modify_l(REG_IPSR, source.bit(), 0);
    if ipsr & source.bit() != 0 {
        return None;
    }
    let vector = irq_vector(regs, source);
    if vector >= MSI_VECTOR_COUNT {
        log::warn!("iommu: interrupt source {:?} mapped to unimplemented vector {}", source, vector);
        return None;
    }
    if vector_masked(regs, vector) {
        regs.set_bits_q(REG_MSI_PBA_BASE, 1 << vector);
        return None;
    }
    Some(vector_message(regs, vector))
}

/// 向量控制寄存器被改写后，若已解除屏蔽且有挂起位则取出消息
pub fn take_pending(regs: &mut RegisterFile, vector: u32) -> Option<MsiMessage> {
    if vector >= MSI_VECTOR_COUNT || vector_masked(regs, vector) {
        return None;
    }
    let pba = regs.load_q(REG_MSI_PBA_BASE);
    if pba & (1 << vector) == 0 {
        return None;
    }
    regs.store_q(REG_MSI_PBA_BASE, pba & !(1 << vector));
    Some(vector_message(regs, vector))
}

/// 中断记录
#[derive(Debug, Clone)]
pub struct InterruptRecord {
    /// 投递的消息
    pub message: MsiMessage,
    /// 投递序号
    pub sequence: u64,
}

/// 中断统计
#[derive(Debug, Clone, Default)]
pub struct InterruptStats {
    /// 总中断次数
    pub total_interrupts: u64,
    /// 被丢弃的中断次数（MSI 未启用）
    pub dropped: u64,
    /// 向量使用计数变化次数
    pub vector_changes: u64,
}

/// 中断控制器
///
/// 记录投递的 MSI 消息的 [`InterruptSink`] 实现，适用于没有真实中断
/// 控制器的场景（单元测试、无 MSI-X 的平台轮询模式）。
pub struct InterruptController {
    /// MSI 是否启用
    msi_enabled: bool,
    /// 中断队列
    interrupt_queue: Mutex<VecDeque<InterruptRecord>>,
    /// 向量使用计数
    vector_users: Mutex<[u32; MSI_VECTOR_COUNT as usize]>,
    /// 中断统计
    stats: Mutex<InterruptStats>,
}

impl Default for InterruptController {
    fn default() -> Self {
        Self::new(true)
    }
}

impl InterruptController {
    /// 创建新的中断控制器
    pub fn new(msi_enabled: bool) -> Self {
        Self {
            msi_enabled,
            interrupt_queue: Mutex::new(VecDeque::new()),
            vector_users: Mutex::new([0; MSI_VECTOR_COUNT as usize]),
            stats: Mutex::new(InterruptStats::default()),
        }
    }

    /// 获取下一个中断
    pub fn get_next_interrupt(&self) -> Option<InterruptRecord> {
        self.interrupt_queue.lock().pop_front()
    }

    /// 检查是否有待处理的中断
    pub fn has_pending_interrupts(&self) -> bool {
        !self.interrupt_queue.lock().is_empty()
    }

    /// 向量是否被使用
    pub fn vector_in_use(&self, vector: u32) -> bool {
        self.vector_users
            .lock()
            .get(vector as usize)
            .is_some_and(|users| *users > 0)
    }

    /// 获取统计信息
    pub fn get_stats(&self) -> InterruptStats {
        self.stats.lock().clone()
    }
}

impl InterruptSink for InterruptController {
    fn notify(&self, message: MsiMessage) {
        let mut stats = self.stats.lock();
        if !self.msi_enabled {
            stats.dropped += 1;
            return;
        }
        stats.total_interrupts += 1;
        let sequence = stats.total_interrupts;
        drop(stats);
        self.interrupt_queue
            .lock()
            .push_back(InterruptRecord { message, sequence });
    }

    fn enabled(&self) -> bool {
        self.msi_enabled
    }

    fn vector_use(&self, vector: u32) {
        if let Some(users) = self.vector_users.lock().get_mut(vector as usize) {
            *users += 1;
            self.stats.lock().vector_changes += 1;
        }
    }

    fn vector_unuse(&self, vector: u32) {
        if let Some(users) = self.vector_users.lock().get_mut(vector as usize) {
            *users = users.saturating_sub(1);
            self.stats.lock().vector_changes += 1;
        }
    }
}

impl std::fmt::Display for InterruptStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "中断统计信息")?;
        writeln!(f, "  总中断次数: {}", self.total_interrupts)?;
        writeln!(f, "  丢弃次数: {}", self.dropped)?;
        writeln!(f, "  向量变更次数: {}", self.vector_changes)
    }
}
