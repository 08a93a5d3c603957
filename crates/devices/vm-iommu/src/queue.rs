//! 客户机内存中的环形队列（CQ/FQ/PQ）
//!
//! 三个队列共用同一套基址寄存器格式和启用/停用流程，区别只在于
//! 哪一侧是生产者：命令队列由客户机写 tail，故障队列和页请求队列由
//! IOMMU 写 tail、客户机写 head。

use crate::interrupt::InterruptSource;
use crate::regs::{
    REG_CQ_BASE, REG_CQ_CONTROL, REG_CQ_HEAD, REG_CQ_TAIL, REG_FQ_BASE, REG_FQ_CONTROL,
    REG_FQ_HEAD, REG_FQ_TAIL, REG_PQ_BASE, REG_PQ_CONTROL, REG_PQ_HEAD, REG_PQ_TAIL,
    RegisterFile, cq_ctrl, fq_ctrl, pq_ctrl, queue_base,
};
use crate::PAGE_SHIFT;

/// 队列种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// 命令队列
    Command,
    /// 故障队列
    Fault,
    /// 页请求队列
    PageRequest,
}

impl QueueKind {
    pub fn base_reg(self) -> u64 {
        match self {
            QueueKind::Command => REG_CQ_BASE,
            QueueKind::Fault => REG_FQ_BASE,
            QueueKind::PageRequest => REG_PQ_BASE,
        }
    }

    pub fn head_reg(self) -> u64 {
        match self {
            QueueKind::Command => REG_CQ_HEAD,
            QueueKind::Fault => REG_FQ_HEAD,
            QueueKind::PageRequest => REG_PQ_HEAD,
        }
    }

    pub fn tail_reg(self) -> u64 {
        match self {
            QueueKind::Command => REG_CQ_TAIL,
            QueueKind::Fault => REG_FQ_TAIL,
            QueueKind::PageRequest => REG_PQ_TAIL,
        }
    }

    pub fn control_reg(self) -> u64 {
        match self {
            QueueKind::Command => REG_CQ_CONTROL,
            QueueKind::Fault => REG_FQ_CONTROL,
            QueueKind::PageRequest => REG_PQ_CONTROL,
        }
    }

    /// 客户机可写的索引寄存器
    pub fn guest_index_reg(self) -> u64 {
        match self {
            QueueKind::Command => REG_CQ_TAIL,
            QueueKind::Fault | QueueKind::PageRequest => self.head_reg(),
        }
    }

    /// 队列项字节数
    pub fn entry_size(self) -> u64 {
        match self {
            QueueKind::Command => 16,
            QueueKind::Fault => 32,
            QueueKind::PageRequest => 16,
        }
    }

    pub fn interrupt_source(self) -> InterruptSource {
        match self {
            QueueKind::Command => InterruptSource::Cq,
            QueueKind::Fault => InterruptSource::Fq,
            QueueKind::PageRequest => InterruptSource::Pq,
        }
    }

    fn enable_bit(self) -> u32 {
        match self {
            QueueKind::Command => cq_ctrl::ENABLE,
            QueueKind::Fault => fq_ctrl::ENABLE,
            QueueKind::PageRequest => pq_ctrl::ENABLE,
        }
    }

    /// 控制寄存器激活位
    pub fn active_bit(self) -> u32 {
        match self {
            QueueKind::Command => cq_ctrl::ACTIVE,
            QueueKind::Fault => fq_ctrl::ACTIVE,
            QueueKind::PageRequest => pq_ctrl::ACTIVE,
        }
    }

    /// 控制寄存器忙位
    pub fn busy_bit(self) -> u32 {
        match self {
            QueueKind::Command => cq_ctrl::BUSY,
            QueueKind::Fault => fq_ctrl::BUSY,
            QueueKind::PageRequest => pq_ctrl::BUSY,
        }
    }

    // 启用时清除的错误状态位
    fn error_bits(self) -> u32 {
        match self {
            QueueKind::Command => cq_ctrl::FAULT | cq_ctrl::ERROR | cq_ctrl::TIMEOUT,
            QueueKind::Fault => fq_ctrl::FAULT | fq_ctrl::FULL,
            QueueKind::PageRequest => pq_ctrl::FAULT | pq_ctrl::FULL,
        }
    }
}

/// 队列状态（IOMMU 侧）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueState {
    /// 队列基址
    pub base: u64,
    /// 索引掩码（项数 - 1）
    pub mask: u32,
    /// IOMMU 消费位置（命令队列）
    pub head: u32,
    /// IOMMU 生产位置（故障/页请求队列）
    pub tail: u32,
}

impl QueueState {
    /// 解析基址寄存器：LOG2SZ 字段为 log2(项数) - 1
    pub fn from_base_reg(val: u64) -> Self {
        let log2sz = val & queue_base::LOG2SZ_MASK;
        Self {
            base: ((val & queue_base::PPN_MASK) >> queue_base::PPN_SHIFT) << PAGE_SHIFT,
            mask: ((2u64 << log2sz) - 1) as u32,
            head: 0,
            tail: 0,
        }
    }

    /// 队列项数
    pub fn entries(&self) -> u64 {
        u64::from(self.mask) + 1
    }

    /// 第 `index` 项的地址
    pub fn slot_addr(&self, index: u32, entry_size: u64) -> u64 {
        self.base
            .wrapping_add(u64::from(index & self.mask) * entry_size)
    }

    pub fn next(&self, index: u32) -> u32 {
        index.wrapping_add(1) & self.mask
    }
}

/// 构造队列基址寄存器值
pub fn encode_base(base: u64, entries_log2: u32) -> u64 {
    let log2sz = u64::from(entries_log2.saturating_sub(1)) & queue_base::LOG2SZ_MASK;
    (((base >> PAGE_SHIFT) << queue_base::PPN_SHIFT) & queue_base::PPN_MASK) | log2sz
}

/// 控制寄存器处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlTransition {
    /// 队列被启用
    Enabled,
    /// 队列被停用
    Disabled,
    /// 状态不变
    Unchanged,
}

/// 处理控制寄存器写入：启用/停用队列并清除忙位
///
/// 启用时从基址寄存器重新载入队列，索引清零，客户机侧索引寄存器
/// 只在掩码位内可写；停用后该寄存器恢复只读。
pub fn process_control(
    regs: &mut RegisterFile,
    kind: QueueKind,
    state: &mut QueueState,
) -> ControlTransition {
    let ctrl = regs.load_l(kind.control_reg());
    let enable = ctrl & kind.enable_bit() != 0;
    let active = ctrl & kind.active_bit() != 0;

    let (transition, set, clr) = if enable && !active {
        *state = QueueState::from_base_reg(regs.load_q(kind.base_reg()));
        regs.set_ro_l(kind.guest_index_reg(), !state.mask);
        regs.store_l(kind.head_reg(), 0);
        regs.store_l(kind.tail_reg(), 0);
        (
            ControlTransition::Enabled,
            kind.active_bit(),
            kind.busy_bit() | kind.error_bits(),
        )
    } else if !enable && active {
        regs.set_ro_l(kind.guest_index_reg(), !0);
        (
            ControlTransition::Disabled,
            0,
            kind.busy_bit() | kind.active_bit(),
        )
    } else {
        (ControlTransition::Unchanged, 0, kind.busy_bit())
    };

    regs.modify_l(kind.control_reg(), set, clr);
    log::debug!(
        "iommu: {:?} queue control {:#x} -> {:?} (base={:#x} entries={})",
        kind,
        ctrl,
        transition,
        state.base,
        state.entries()
    );
    transition
}
