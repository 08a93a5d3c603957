// IOMMU错误类型定义
//
// 两类错误：
// - IommuError：宿主侧错误（配置、通知器、线程创建等），按 Result 传播
// - Fault：客户机可见的转换故障，写入故障队列，不作为 Rust 错误传播

use std::fmt;
use thiserror::Error;

/// IOMMU宿主侧错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IommuError {
    /// 配置错误
    #[error("Config Error: {0}")]
    ConfigError(String),
    /// 配置解析错误
    #[error("Config Parse Error: {0}")]
    ConfigParse(String),
    /// 配置序列化错误
    #[error("Config Serialize Error: {0}")]
    ConfigSerialize(String),
    /// 不支持的 IOMMU 通知器
    #[error("Unsupported notifier: {0}")]
    UnsupportedNotifier(String),
    /// 客户机内存访问失败
    #[error("Guest memory access failed: addr={addr:#x} len={len}")]
    MemoryAccess { addr: u64, len: usize },
    /// 核心处理线程创建失败
    #[error("Core thread error: {0}")]
    ThreadError(String),
}

/// IOMMU结果类型
pub type IommuResult<T> = Result<T, IommuError>;

/// 故障原因（写入故障记录 CAUSE 字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FaultCause {
    /// Instruction address misaligned
    InstrAlign = 0,
    /// Instruction access fault
    InstrFault = 1,
    /// Read address misaligned
    ReadAlign = 4,
    /// Read access fault
    ReadFault = 5,
    /// Write/AMO address misaligned
    WriteAlign = 6,
    /// Write/AMO access fault
    WriteFault = 7,
    /// Instruction page fault
    PageFaultInstr = 12,
    /// Read page fault
    PageFaultRead = 13,
    /// Write/AMO page fault
    PageFaultWrite = 15,
    /// Instruction guest page fault
    GuestPageFaultInstr = 20,
    /// Read guest-page fault
    GuestPageFaultRead = 21,
    /// Write/AMO guest-page fault
    GuestPageFaultWrite = 23,
    /// Inbound transactions disallowed
    DmaDisabled = 256,
    /// DDT entry load access fault
    DdtFault = 257,
    /// DDT entry not valid
    DdtInvalid = 258,
    /// DDT entry misconfigured
    DdtUnsupported = 259,
    /// Transaction type disallowed
    ReqInvalid = 260,
    /// PDT entry load access fault
    PdtFault = 261,
    /// PDT entry not valid
    PdtInvalid = 262,
    /// PDT entry misconfigured
    PdtUnsupported = 263,
    /// MSI PTE load access fault
    MsiFault = 264,
    /// MSI PTE not valid
    MsiInvalid = 265,
    /// MRIF access fault
    MrifFault = 266,
}

impl FaultCause {
    /// 原始编码
    pub fn code(self) -> u16 {
        self as u16
    }

    /// 从原始编码解析
    pub fn from_code(code: u16) -> Option<Self> {
        use FaultCause::*;
        let cause = match code {
            0 => InstrAlign,
            1 => InstrFault,
            4 => ReadAlign,
            5 => ReadFault,
            6 => WriteAlign,
            7 => WriteFault,
            12 => PageFaultInstr,
            13 => PageFaultRead,
            15 => PageFaultWrite,
            20 => GuestPageFaultInstr,
            21 => GuestPageFaultRead,
            23 => GuestPageFaultWrite,
            256 => DmaDisabled,
            257 => DdtFault,
            258 => DdtInvalid,
            259 => DdtUnsupported,
            260 => ReqInvalid,
            261 => PdtFault,
            262 => PdtInvalid,
            263 => PdtUnsupported,
            264 => MsiFault,
            265 => MsiInvalid,
            266 => MrifFault,
            _ => return None,
        };
        Some(cause)
    }
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// 事务类型（写入故障记录 TTYP 字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum TransactionType {
    /// 非入站事务引起的故障
    #[default]
    None = 0,
    /// Untranslated read for execute
    UntranslatedExec = 1,
    /// Untranslated read
    UntranslatedRead = 2,
    /// Untranslated write/AMO
    UntranslatedWrite = 3,
    /// Translated read for execute
    TranslatedExec = 4,
    /// Translated read
    TranslatedRead = 5,
    /// Translated write/AMO
    TranslatedWrite = 6,
    /// PCIe ATS translation request
    AtsRequest = 7,
    /// Message request
    MessageRequest = 8,
}

impl TransactionType {
    /// 原始编码
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// 客户机可见的转换故障
///
/// `phys` 为故障发生前已到达的地址（例如 stage-two 失败时的 GPA），
/// 没有时为 0。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub cause: FaultCause,
    pub ttyp: TransactionType,
    pub phys: u64,
}

impl Fault {
    /// 不关联入站事务的故障
    pub fn new(cause: FaultCause) -> Self {
        Self {
            cause,
            ttyp: TransactionType::None,
            phys: 0,
        }
    }

    /// 设置事务类型
    pub fn with_ttyp(mut self, ttyp: TransactionType) -> Self {
        self.ttyp = ttyp;
        self
    }

    /// 设置故障前到达的物理地址
    pub fn with_phys(mut self, phys: u64) -> Self {
        self.phys = phys;
        self
    }
}

impl From<FaultCause> for Fault {
    fn from(cause: FaultCause) -> Self {
        Fault::new(cause)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ttyp={} phys={:#x}",
            self.cause,
            self.ttyp.code(),
            self.phys
        )
    }
}
