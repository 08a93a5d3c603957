// 命令队列（Command Queue）处理
//
// 命令为 16 字节：request（低 10 位为 func3|opcode）+ address。
// IOTLB 相关命令被接受但没有可观察的效果。

use std::fmt;

use crate::memory::GuestMemory;
use crate::queue::{QueueKind, QueueState};
use crate::regs::cq_ctrl;

const OPCODE_MASK: u64 = 0x3FF;

/// 命令操作码（func3 | opcode）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// IOTINVAL.VMA
    IotinvalVma,
    /// IOTINVAL.GVMA
    IotinvalGvma,
    /// IOTINVAL.MSI
    IotinvalMsi,
    /// IODIR.INV_DDT
    IodirInvDdt,
    /// IODIR.PRE_DDT
    IodirPreDdt,
    /// IODIR.INV_PDT
    IodirInvPdt,
    /// IODIR.PRE_PDT
    IodirPrePdt,
    /// IOFENCE.C
    IofenceC,
    /// ATS.INVAL
    AtsInval,
    /// ATS.PRGR
    AtsPrgr,
}

impl Opcode {
    pub fn from_bits(bits: u64) -> Option<Self> {
        let op = match bits & OPCODE_MASK {
            0x001 => Opcode::IotinvalVma,
            0x081 => Opcode::IotinvalGvma,
            0x101 => Opcode::IotinvalMsi,
            0x002 => Opcode::IodirInvDdt,
            0x082 => Opcode::IodirPreDdt,
            0x102 => Opcode::IodirInvPdt,
            0x182 => Opcode::IodirPrePdt,
            0x003 => Opcode::IofenceC,
            0x004 => Opcode::AtsInval,
            0x084 => Opcode::AtsPrgr,
            _ => return None,
        };
        Some(op)
    }

    pub fn bits(self) -> u64 {
        match self {
            Opcode::IotinvalVma => 0x001,
            Opcode::IotinvalGvma => 0x081,
            Opcode::IotinvalMsi => 0x101,
            Opcode::IodirInvDdt => 0x002,
            Opcode::IodirPreDdt => 0x082,
            Opcode::IodirInvPdt => 0x102,
            Opcode::IodirPrePdt => 0x182,
            Opcode::IofenceC => 0x003,
            Opcode::AtsInval => 0x004,
            Opcode::AtsPrgr => 0x084,
        }
    }
}

/// 命令字段位
pub mod fields {
    // IOTINVAL
    pub const PSCID_VALID: u64 = 1 << 10;
    pub const ADDR_VALID: u64 = 1 << 11;
    pub const GSCID_VALID: u64 = 1 << 12;
    pub const NAPOT: u64 = 1 << 13;
    pub const PSCID_SHIFT: u64 = 16;
    pub const PSCID_MASK: u64 = 0x0000_000F_FFFF_0000;
    pub const GSCID_SHIFT: u64 = 40;
    pub const GSCID_MASK: u64 = 0x00FF_FF00_0000_0000;
    // IODIR
    pub const DID_VALID: u64 = 1 << 10;
    pub const PID_SHIFT: u64 = 16;
    pub const PID_MASK: u64 = 0x0000_000F_FFFF_0000;
    pub const DID_SHIFT: u64 = 40;
    pub const DID_MASK: u64 = 0xFFFF_FF00_0000_0000;
    // IOFENCE
    pub const PR: u64 = 1 << 10;
    pub const PW: u64 = 1 << 11;
    pub const AV: u64 = 1 << 12;
    pub const DATA_SHIFT: u64 = 32;
}

/// 命令记录
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Command {
    pub request: u64,
    pub address: u64,
}

impl Command {
    /// 记录大小
    pub const SIZE: usize = 16;

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut request = [0u8; 8];
        let mut address = [0u8; 8];
        request.copy_from_slice(&bytes[..8]);
        address.copy_from_slice(&bytes[8..]);
        Self {
            request: u64::from_le_bytes(request),
            address: u64::from_le_bytes(address),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[..8].copy_from_slice(&self.request.to_le_bytes());
        bytes[8..].copy_from_slice(&self.address.to_le_bytes());
        bytes
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_bits(self.request)
    }

    /// IODIR.INV_DDT：`devid` 为 `None` 时作用于全部设备
    pub fn inval_ddt(devid: Option<u32>) -> Self {
        let mut request = Opcode::IodirInvDdt.bits();
        if let Some(devid) = devid {
            request |= fields::DID_VALID | ((u64::from(devid) << fields::DID_SHIFT) & fields::DID_MASK);
        }
        Self {
            request,
            address: 0,
        }
    }

    /// IOFENCE.C，`completion` 为完成时写入的 (地址, 数据)
    pub fn iofence(completion: Option<(u64, u32)>) -> Self {
        let mut request = Opcode::IofenceC.bits();
        let mut address = 0;
        if let Some((addr, data)) = completion {
            request |= fields::AV | (u64::from(data) << fields::DATA_SHIFT);
            address = addr;
        }
        Self { request, address }
    }

    /// IODIR 命令的目标设备
    pub fn device_id(&self) -> Option<u32> {
        (self.request & fields::DID_VALID != 0)
            .then(|| ((self.request & fields::DID_MASK) >> fields::DID_SHIFT) as u32)
    }

    pub fn process_id(&self) -> u32 {
        ((self.request & fields::PID_MASK) >> fields::PID_SHIFT) as u32
    }

    pub fn pscid(&self) -> Option<u32> {
        (self.request & fields::PSCID_VALID != 0)
            .then(|| ((self.request & fields::PSCID_MASK) >> fields::PSCID_SHIFT) as u32)
    }

    pub fn gscid(&self) -> Option<u32> {
        (self.request & fields::GSCID_VALID != 0)
            .then(|| ((self.request & fields::GSCID_MASK) >> fields::GSCID_SHIFT) as u32)
    }

    /// IOFENCE.C 完成写入 (地址, 数据)
    pub fn fence_completion(&self) -> Option<(u64, u32)> {
        (self.request & fields::AV != 0)
            .then(|| (self.address, (self.request >> fields::DATA_SHIFT) as u32))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.opcode() {
            Some(op) => write!(f, "{:?}", op)?,
            None => write!(f, "Unknown({:#x})", self.request & OPCODE_MASK)?,
        }
        write!(f, " req={:#018x} addr={:#x}", self.request, self.address)
    }
}

/// 命令对 IOMMU 状态的作用
pub trait CommandHandler {
    /// 使设备上下文缓存失效；`None` 表示全部设备
    fn invalidate_ddt(&mut self, devid: Option<u32>);
}

impl<F: FnMut(Option<u32>)> CommandHandler for F {
    fn invalidate_ddt(&mut self, devid: Option<u32>) {
        self(devid)
    }
}

/// 一次排空的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainResult {
    /// 新的 head
    pub head: u32,
    /// 需要置位的 CQ 控制寄存器错误位
    pub error: u32,
    /// 成功执行的命令数
    pub processed: u64,
}

/// 从 `cq.head` 处理命令直到 `tail`
///
/// 读取失败置 CQ_FAULT，未知操作码置 CQ_ERROR；两种情况下 head 停在
/// 出错的命令处。
pub fn drain(
    mem: &dyn GuestMemory,
    cq: &QueueState,
    tail: u32,
    handler: &mut dyn CommandHandler,
) -> DrainResult {
    let mut result = DrainResult {
        head: cq.head & cq.mask,
        ..Default::default()
    };
    let tail = tail & cq.mask;

    while result.head != tail {
        let addr = cq.slot_addr(result.head, QueueKind::Command.entry_size());
        let mut bytes = [0u8; Command::SIZE];
        if let Err(err) = mem.read(addr, &mut bytes) {
            log::warn!("iommu: command fetch at {:#x} failed: {}", addr, err);
            result.error = cq_ctrl::FAULT;
            break;
        }
        let cmd = Command::from_bytes(&bytes);
        log::trace!("iommu: cmd[{}] {}", result.head, cmd);

        let Some(op) = cmd.opcode() else {
            log::warn!("iommu: illegal command {}", cmd);
            result.error = cq_ctrl::ERROR;
            break;
        };

        match op {
            Opcode::IofenceC => {
                if let Some((addr, data)) = cmd.fence_completion() {
                    if let Err(err) = mem.write_u32(addr, data) {
                        log::warn!("iommu: iofence completion write failed: {}", err);
                        result.error = cq_ctrl::FAULT;
                        break;
                    }
                }
            }
            Opcode::IodirInvDdt => handler.invalidate_ddt(cmd.device_id()),
            // IOTLB / PDT / ATS 未实现
            Opcode::IotinvalVma | Opcode::IotinvalGvma | Opcode::IotinvalMsi => {
                log::trace!(
                    "iommu: {:?} pscid={:?} gscid={:?} ignored",
                    op,
                    cmd.pscid(),
                    cmd.gscid()
                );
            }
            Opcode::IodirInvPdt | Opcode::IodirPrePdt => {
                log::trace!(
                    "iommu: {:?} dev={:?} pid={:#x} ignored",
                    op,
                    cmd.device_id(),
                    cmd.process_id()
                );
            }
            Opcode::IodirPreDdt | Opcode::AtsInval | Opcode::AtsPrgr => {}
        }

        result.processed += 1;
        result.head = cq.next(result.head);
    }
    result
}
