// 故障队列（Fault Queue）上报
//
// 故障记录为 32 字节：
// - reason：DID[23:0] | PID[43:24] | PV[44] | PRIV[45] | TTYP[51:46] | CAUSE[63:52]
// - 保留 8 字节
// - iova
// - phys（故障前到达的地址，没有时为 0）

use crate::error::{Fault, FaultCause, TransactionType};
use crate::interrupt::{InterruptSource, MsiMessage, assert_irq};
use crate::memory::GuestMemory;
use crate::queue::{QueueKind, QueueState};
use crate::regs::{REG_FQ_CONTROL, REG_FQ_HEAD, REG_FQ_TAIL, RegisterFile, fq_ctrl};

const DID_MASK: u64 = 0x0000_0000_00FF_FFFF;
const PID_SHIFT: u64 = 24;
const PID_MASK: u64 = 0x0000_0FFF_FF00_0000;
const PV: u64 = 1 << 44;
const PRIV: u64 = 1 << 45;
const TTYP_SHIFT: u64 = 46;
const TTYP_MASK: u64 = 0x000F_C000_0000_0000;
const CAUSE_SHIFT: u64 = 52;

/// 故障记录
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    /// 设备 ID
    pub devid: u32,
    /// 进程 ID（PV 置位时有效）
    pub pid: Option<u32>,
    /// 特权访问
    pub privileged: bool,
    /// 事务类型
    pub ttyp: TransactionType,
    /// 故障原因
    pub cause: FaultCause,
    /// 故障 IOVA
    pub iova: u64,
    /// 故障前到达的物理地址
    pub phys: u64,
}

impl FaultRecord {
    /// 记录大小
    pub const SIZE: usize = 32;

    /// 由转换故障创建记录
    pub fn new(devid: u32, fault: Fault, iova: u64) -> Self {
        Self {
            devid,
            pid: None,
            privileged: false,
            ttyp: fault.ttyp,
            cause: fault.cause,
            iova,
            phys: fault.phys,
        }
    }

    /// 打包 reason 字段
    pub fn reason(&self) -> u64 {
        let mut reason = u64::from(self.devid) & DID_MASK;
        if let Some(pid) = self.pid {
            reason |= ((u64::from(pid) << PID_SHIFT) & PID_MASK) | PV;
        }
        if self.privileged {
            reason |= PRIV;
        }
        reason
            | ((u64::from(self.ttyp.code()) << TTYP_SHIFT) & TTYP_MASK)
            | (u64::from(self.cause.code()) << CAUSE_SHIFT)
    }

    /// 序列化为小端字节
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.reason().to_le_bytes());
        bytes[16..24].copy_from_slice(&self.iova.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.phys.to_le_bytes());
        bytes
    }

    /// 解析 reason 中的原因编码
    pub fn cause_of(reason: u64) -> u16 {
        (reason >> CAUSE_SHIFT) as u16
    }

    /// 解析 reason 中的事务类型编码
    pub fn ttyp_of(reason: u64) -> u8 {
        ((reason & TTYP_MASK) >> TTYP_SHIFT) as u8
    }

    /// 解析 reason 中的设备 ID
    pub fn devid_of(reason: u64) -> u32 {
        (reason & DID_MASK) as u32
    }
}

/// 上报结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    /// 已写入队列；附带需要投递的中断
    Written(Option<MsiMessage>),
    /// 故障队列未激活
    Inactive,
    /// 故障队列处于 FAULT 或 FULL 状态，记录被丢弃
    Suppressed,
    /// 队列已满，置位 FULL
    Overflow,
    /// 写入客户机内存失败，置位 FAULT
    WriteFailed,
}

/// 向故障队列追加记录
///
/// FULL 状态下若客户机已推进 head 腾出空间，则清除 FULL 并继续写入。
pub fn report(
    regs: &mut RegisterFile,
    fq: &mut QueueState,
    mem: &dyn GuestMemory,
    record: &FaultRecord,
) -> ReportOutcome {
    let ctrl = regs.load_l(REG_FQ_CONTROL);
    if ctrl & fq_ctrl::ACTIVE == 0 {
        return ReportOutcome::Inactive;
    }
    if ctrl & fq_ctrl::FAULT != 0 {
        return ReportOutcome::Suppressed;
    }

    let head = regs.load_l(REG_FQ_HEAD) & fq.mask;
    let next = fq.next(fq.tail);
    if next == head {
        if ctrl & fq_ctrl::FULL != 0 {
            return ReportOutcome::Suppressed;
        }
        regs.modify_l(REG_FQ_CONTROL, fq_ctrl::FULL, 0);
        log::warn!("iommu: fault queue full, dropping {:?}", record.cause);
        return ReportOutcome::Overflow;
    }
    if ctrl & fq_ctrl::FULL != 0 {
        regs.modify_l(REG_FQ_CONTROL, 0, fq_ctrl::FULL);
    }

    let addr = fq.slot_addr(fq.tail, QueueKind::Fault.entry_size());
    if let Err(err) = mem.write(addr, &record.to_bytes()) {
        log::warn!("iommu: fault record write failed: {}", err);
        regs.modify_l(REG_FQ_CONTROL, fq_ctrl::FAULT, 0);
        return ReportOutcome::WriteFailed;
    }
    fq.tail = next;
    regs.store_l(REG_FQ_TAIL, fq.tail);

    let irq = if ctrl & fq_ctrl::IRQ_ENABLE != 0 {
        assert_irq(regs, InterruptSource::Fq)
    } else {
        None
    };
    ReportOutcome::Written(irq)
}
