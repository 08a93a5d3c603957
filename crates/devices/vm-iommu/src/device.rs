// IOMMU设备核心实现
//
// 实现 IOMMU 的设备功能，包括：
// - 寄存器 MMIO 访问
// - 核心处理线程（命令队列、队列控制、DDTP 切换）
// - 设备地址空间与设备上下文缓存
// - DMA 地址转换入口

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::ops::BitOr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::command::{self, CommandHandler};
use crate::config::IommuConfig;
use crate::context::{DdtMode, DeviceContext, DeviceId, DirectoryTable};
use crate::error::{Fault, FaultCause, IommuError, IommuResult, TransactionType};
use crate::fault::{self, FaultRecord, ReportOutcome};
use crate::interrupt::{
    InterruptSink, InterruptSource, MsiMessage, assert_irq, irq_vector, take_pending,
};
use crate::memory::GuestMemory;
use crate::msi;
use crate::queue::{self, ControlTransition, QueueKind, QueueState};
use crate::regs::{
    self, REG_CQ_CONTROL, REG_CQ_HEAD, REG_CQ_TAIL, REG_DDTP, REG_WINDOW_SIZE, RegisterFile,
    WriteEffect, cq_ctrl, ddtp,
};
use crate::stats::IommuStats;
use crate::walk::{PageTableWalker, TranslationStage};
use crate::{AccessFlags, PAGE_MASK, PAGE_SHIFT};

/// BAR0 大小（寄存器窗口向上取整到 2 的幂）
pub const BAR0_SIZE: u64 = (REG_WINDOW_SIZE as u64).next_power_of_two();

/// IOMMU 通知器类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NotifierFlags(u32);

impl NotifierFlags {
    pub const NONE: Self = Self(0);
    pub const UNMAP: Self = Self(1 << 0);
    pub const MAP: Self = Self(1 << 1);
    /// 设备侧 IOTLB 失效通知
    pub const DEVIOTLB_UNMAP: Self = Self(1 << 2);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }
}

impl BitOr for NotifierFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// 地址转换结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IotlbEntry {
    /// 输入地址
    pub iova: u64,
    /// 转换后的地址
    pub translated_addr: u64,
    /// 映射粒度掩码
    pub addr_mask: u64,
    /// 允许的访问，转换失败时为 `AccessFlags::None`
    pub perm: AccessFlags,
}

impl IotlbEntry {
    fn denied(iova: u64) -> Self {
        Self {
            iova,
            translated_addr: 0,
            addr_mask: 0,
            perm: AccessFlags::None,
        }
    }

    fn identity(iova: u64, perm: AccessFlags, addr_mask: u64) -> Self {
        Self {
            iova,
            translated_addr: iova,
            addr_mask,
            perm,
        }
    }

    /// 转换是否成功
    pub fn is_mapped(&self) -> bool {
        self.perm != AccessFlags::None
    }
}

/// IOMMU 内存区域接口（由总线在每次 DMA 访问时调用）
pub trait IommuMemoryRegion {
    /// 转换一次 DMA 访问
    fn translate(&self, iova: u64, access: AccessFlags) -> IotlbEntry;

    /// 注册的通知器类型变化
    fn notify_flag_changed(&self, old: NotifierFlags, new: NotifierFlags) -> IommuResult<()>;
}

// 单个设备的上下文缓存槽
#[derive(Debug, Default)]
struct ContextSlot {
    dc: Option<DeviceContext>,
    // 每次失效递增，防止并发取回的旧上下文被缓存
    generation: u64,
}

// 转换开始时的目录表状态
#[derive(Debug, Clone, Copy)]
struct ContextSnapshot {
    mode: DdtMode,
    table: DirectoryTable,
    cached: Option<DeviceContext>,
    generation: u64,
}

// 核心锁保护的状态
struct CoreState {
    regs: RegisterFile,
    ddt_mode: DdtMode,
    ddt_base: u64,
    cq: QueueState,
    fq: QueueState,
    pq: QueueState,
    cq_tail_db: bool,
    stop: bool,
    spaces: HashMap<DeviceId, ContextSlot>,
}

impl CoreState {
    fn new(capabilities: u64) -> Self {
        let mut regs = RegisterFile::new();
        regs.reset(capabilities);
        Self {
            regs,
            ddt_mode: DdtMode::Off,
            ddt_base: 0,
            cq: QueueState::default(),
            fq: QueueState::default(),
            pq: QueueState::default(),
            cq_tail_db: false,
            stop: false,
            spaces: HashMap::new(),
        }
    }

    fn regs_and_queue(&mut self, kind: QueueKind) -> (&mut RegisterFile, &mut QueueState) {
        match kind {
            QueueKind::Command => (&mut self.regs, &mut self.cq),
            QueueKind::Fault => (&mut self.regs, &mut self.fq),
            QueueKind::PageRequest => (&mut self.regs, &mut self.pq),
        }
    }

    fn invalidate(&mut self, devid: Option<DeviceId>) {
        for (id, slot) in self.spaces.iter_mut() {
            if devid.is_none_or(|devid| devid == *id) {
                slot.dc = None;
                slot.generation += 1;
            }
        }
    }

    fn pending(&self, event: CoreEvent) -> bool {
        match event {
            CoreEvent::CommandDoorbell => self.cq_tail_db,
            CoreEvent::QueueControl(kind) => {
                self.regs.load_l(kind.control_reg()) & kind.busy_bit() != 0
            }
            CoreEvent::DdtpUpdate => self.regs.load_q(REG_DDTP) & ddtp::BUSY != 0,
        }
    }
}

/// 核心线程事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoreEvent {
    CommandDoorbell,
    QueueControl(QueueKind),
    DdtpUpdate,
}

/// 核心线程按此顺序检查待处理事件：命令先于 DDTP 切换生效
const CORE_EVENTS: [CoreEvent; 5] = [
    CoreEvent::CommandDoorbell,
    CoreEvent::QueueControl(QueueKind::Command),
    CoreEvent::QueueControl(QueueKind::Fault),
    CoreEvent::QueueControl(QueueKind::PageRequest),
    CoreEvent::DdtpUpdate,
];

// 需要在释放核心锁后执行的中断操作
#[derive(Debug, Clone, Copy)]
enum SinkAction {
    Notify(MsiMessage),
    VectorUse(u32),
    VectorUnuse(u32),
}

struct Shared {
    config: IommuConfig,
    bdf: u32,
    mem: Arc<dyn GuestMemory>,
    sink: Arc<dyn InterruptSink>,
    core: Mutex<CoreState>,
    wakeup: Condvar,
    stats: Mutex<IommuStats>,
}

impl Shared {
    fn perform(&self, action: SinkAction) {
        match action {
            SinkAction::Notify(message) => {
                if !self.sink.enabled() {
                    log::debug!("iommu: MSI-X disabled, vector {} not sent", message.vector);
                    return;
                }
                self.stats.lock().interrupts += 1;
                self.sink.notify(message);
            }
            SinkAction::VectorUse(vector) => self.sink.vector_use(vector),
            SinkAction::VectorUnuse(vector) => self.sink.vector_unuse(vector),
        }
    }

    fn core_loop(&self) {
        let mut core = self.core.lock();
        while !core.stop {
            let Some(event) = CORE_EVENTS.iter().copied().find(|ev| core.pending(*ev)) else {
                self.wakeup.wait(&mut core);
                continue;
            };
            let action = match event {
                CoreEvent::CommandDoorbell => self.process_cq_tail(&mut core),
                CoreEvent::QueueControl(kind) => Self::process_queue_control(&mut core, kind),
                CoreEvent::DdtpUpdate => {
                    Self::process_ddtp(&mut core);
                    None
                }
            };
            if let Some(action) = action {
                MutexGuard::unlocked(&mut core, || self.perform(action));
            }
        }
        log::debug!("iommu: core thread stopped");
    }

    fn process_cq_tail(&self, core: &mut MutexGuard<'_, CoreState>) -> Option<SinkAction> {
        core.cq_tail_db = false;
        let ctrl = core.regs.load_l(REG_CQ_CONTROL);
        let cq = core.cq;
        let tail = core.regs.load_l(REG_CQ_TAIL) & cq.mask;

        if ctrl & cq_ctrl::ACTIVE == 0 || ctrl & (cq_ctrl::ERROR | cq_ctrl::FAULT) != 0 {
            return None;
        }

        // 访问客户机内存时不持有核心锁
        let result = MutexGuard::unlocked(core, || {
            let mut handler = |devid: Option<u32>| self.invalidate_contexts(devid);
            command::drain(&*self.mem, &cq, tail, &mut handler as &mut dyn CommandHandler)
        });

        core.cq.head = result.head;
        core.regs.store_l(REG_CQ_HEAD, result.head);
        {
            let mut stats = self.stats.lock();
            stats.total_commands += result.processed;
            if result.error != 0 {
                stats.command_errors += 1;
            }
        }
        if result.error != 0 {
            core.regs.modify_l(REG_CQ_CONTROL, result.error, 0);
        }

        if ctrl & cq_ctrl::IRQ_ENABLE != 0 {
            assert_irq(&mut core.regs, InterruptSource::Cq).map(SinkAction::Notify)
        } else {
            None
        }
    }

    fn process_queue_control(core: &mut CoreState, kind: QueueKind) -> Option<SinkAction> {
        let (regs, state) = core.regs_and_queue(kind);
        let transition = queue::process_control(regs, kind, state);
        let vector = irq_vector(regs, kind.interrupt_source());
        match transition {
            ControlTransition::Enabled => Some(SinkAction::VectorUse(vector)),
            ControlTransition::Disabled => Some(SinkAction::VectorUnuse(vector)),
            ControlTransition::Unchanged => None,
        }
    }

    fn process_ddtp(core: &mut CoreState) {
        let val = core.regs.load_q(REG_DDTP) & !ddtp::BUSY;
        let current = core.ddt_mode;
        let accepted = DdtMode::from_bits(val >> ddtp::MODE_SHIFT)
            .filter(|mode| current.can_transition_to(*mode));

        match accepted {
            Some(mode) => {
                let base = (val & ddtp::PPN_MASK) << PAGE_SHIFT;
                if mode != current || base != core.ddt_base {
                    core.invalidate(None);
                }
                log::debug!(
                    "iommu: ddtp {:?} -> {:?} base={:#x}",
                    current,
                    mode,
                    base
                );
                core.ddt_mode = mode;
                core.ddt_base = base;
                core.regs.store_q(REG_DDTP, val);
            }
            None => {
                log::warn!(
                    "iommu: rejected ddtp mode {} from {:?}",
                    val >> ddtp::MODE_SHIFT,
                    current
                );
                let restored = ((core.ddt_base >> PAGE_SHIFT) & ddtp::PPN_MASK)
                    | (current.bits() << ddtp::MODE_SHIFT);
                core.regs.store_q(REG_DDTP, restored);
            }
        }
    }

    fn invalidate_contexts(&self, devid: Option<u32>) {
        let mut core = self.core.lock();
        match devid {
            Some(bits) => {
                if let Some(id) = DeviceId::new(bits) {
                    core.invalidate(Some(id));
                }
            }
            None => core.invalidate(None),
        }
    }

    fn report_fault(&self, devid: DeviceId, fault: Fault, iova: u64) {
        log::debug!("iommu: fault {} dev {} iova {:#x}", fault, devid, iova);
        let record = FaultRecord::new(devid.bits(), fault, iova);
        let outcome = {
            let mut core = self.core.lock();
            let CoreState { regs, fq, .. } = &mut *core;
            fault::report(regs, fq, &*self.mem, &record)
        };
        match outcome {
            ReportOutcome::Written(message) => {
                self.stats.lock().faults_reported += 1;
                if let Some(message) = message {
                    self.perform(SinkAction::Notify(message));
                }
            }
            _ => self.stats.lock().faults_dropped += 1,
        }
    }

    // 在同一临界区内读取目录表模式、基址和缓存槽
    fn snapshot(&self, devid: DeviceId) -> ContextSnapshot {
        let mut core = self.core.lock();
        let mode = core.ddt_mode;
        let table = DirectoryTable::new(core.ddt_base, mode, self.config.msi);
        let slot = core.spaces.entry(devid).or_default();
        ContextSnapshot {
            mode,
            table,
            cached: slot.dc,
            generation: slot.generation,
        }
    }

    fn device_context(&self, devid: DeviceId, snap: &ContextSnapshot) -> Result<DeviceContext, Fault> {
        if let Some(dc) = snap.cached {
            self.stats.lock().update_context_lookup(true);
            return Ok(dc);
        }
        self.stats.lock().update_context_lookup(false);

        let dc = snap.table.fetch(&*self.mem, devid.bits())?;
        log::debug!(
            "iommu: dev {} context loaded (ats={} pri={} t2gpa={} pscid={:#x})",
            devid,
            dc.ats_enabled(),
            dc.pri_enabled(),
            dc.t2gpa(),
            dc.pscid
        );

        // 取回期间发生过失效（包括 DDTP 切换）则只用于本次转换
        let mut core = self.core.lock();
        if let Some(slot) = core.spaces.get_mut(&devid) {
            if slot.generation == snap.generation {
                slot.dc = Some(dc);
            }
        }
        Ok(dc)
    }

    fn translate_with_context(
        &self,
        dc: &DeviceContext,
        iova: u64,
        access: AccessFlags,
    ) -> Result<IotlbEntry, Fault> {
        if self.config.msi && msi::in_window(dc, iova) {
            let mapping = msi::remap(dc, iova, access)?;
            return Ok(IotlbEntry {
                iova,
                translated_addr: mapping.translated_addr,
                addr_mask: mapping.addr_mask,
                perm: access,
            });
        }

        // 进程目录表未实现
        if dc.pdt_valid() {
            return Err(Fault::new(FaultCause::PdtUnsupported));
        }

        let stage = if self.config.stage_one {
            TranslationStage::Stage1
        } else {
            TranslationStage::Stage2
        };
        let pa = PageTableWalker::new(&*self.mem, dc.gatp, dc.satp).translate(iova, stage, access)?;
        Ok(IotlbEntry {
            iova,
            translated_addr: pa,
            addr_mask: PAGE_MASK,
            perm: access,
        })
    }

    fn translate(&self, devid: DeviceId, iova: u64, access: AccessFlags) -> IotlbEntry {
        self.stats.lock().total_translations += 1;
        let ttyp = if access == AccessFlags::WriteOnly {
            TransactionType::UntranslatedWrite
        } else {
            TransactionType::UntranslatedRead
        };
        let snap = self.snapshot(devid);

        match snap.mode {
            // 上电状态，禁止所有 DMA
            DdtMode::Off => {
                self.report_fault(devid, Fault::new(FaultCause::DmaDisabled).with_ttyp(ttyp), iova);
                IotlbEntry::denied(iova)
            }
            DdtMode::Bare => {
                self.stats.lock().passthrough += 1;
                IotlbEntry::identity(iova, access, !0)
            }
            DdtMode::OneLevel | DdtMode::TwoLevel | DdtMode::ThreeLevel => {
                let dc = match self.device_context(devid, &snap) {
                    Ok(dc) => dc,
                    Err(fault) => {
                        self.report_fault(devid, fault.with_ttyp(ttyp), iova);
                        return IotlbEntry::denied(iova);
                    }
                };
                match self.translate_with_context(&dc, iova, access) {
                    Ok(entry) => entry,
                    Err(fault) => {
                        if dc.fault_disabled() {
                            log::debug!("iommu: fault {} dev {} not reported", fault, devid);
                        } else {
                            self.report_fault(devid, fault.with_ttyp(ttyp), iova);
                        }
                        IotlbEntry::denied(iova)
                    }
                }
            }
        }
    }
}

/// 设备地址空间（每个经过 IOMMU 的 PCI requester 一个）
pub struct DeviceSpace {
    shared: Arc<Shared>,
    devid: DeviceId,
    // IOMMU 自身的 DMA 不经过转换
    passthrough: bool,
}

impl DeviceSpace {
    /// requester ID
    pub fn device_id(&self) -> DeviceId {
        self.devid
    }

    /// 地址空间名称
    pub fn name(&self) -> String {
        format!("iommu-{}-iova", self.devid)
    }

    /// 是否为 IOMMU 自身的直通地址空间
    pub fn is_passthrough(&self) -> bool {
        self.passthrough
    }
}

impl IommuMemoryRegion for DeviceSpace {
    fn translate(&self, iova: u64, access: AccessFlags) -> IotlbEntry {
        let entry = if self.passthrough {
            IotlbEntry::identity(iova, access, !0)
        } else {
            self.shared.translate(self.devid, iova, access)
        };
        log::trace!(
            "iommu: dma {} {} iova={:#x} -> {:#x}",
            self.devid,
            entry.perm.as_str(),
            iova,
            entry.translated_addr
        );
        entry
    }

    fn notify_flag_changed(&self, old: NotifierFlags, new: NotifierFlags) -> IommuResult<()> {
        if new.contains(NotifierFlags::DEVIOTLB_UNMAP) {
            return Err(IommuError::UnsupportedNotifier(
                "device IOTLB notifiers are not supported".to_string(),
            ));
        }
        log::debug!(
            "iommu: {} notifier flags {:#x} -> {:#x}",
            self.devid,
            old.bits(),
            new.bits()
        );
        Ok(())
    }
}

/// IOMMU设备
pub struct IommuDevice {
    shared: Arc<Shared>,
    core_thread: Option<JoinHandle<()>>,
}

impl IommuDevice {
    /// 创建并启动 IOMMU 设备
    ///
    /// # 参数
    /// - `config`: 设备配置
    /// - `mem`: 客户机物理内存
    /// - `sink`: MSI-X 中断投递接口
    /// - `bdf`: IOMMU 自身的 requester ID
    ///
    /// # 示例
    /// ```ignore
    /// let mem = Arc::new(GuestRam::with_region(0x8000_0000, 0x100_0000));
    /// let irq = Arc::new(InterruptController::default());
    /// let iommu = IommuDevice::new(IommuConfig::default(), mem, irq, 0x0008)?;
    /// ```
    pub fn new(
        config: IommuConfig,
        mem: Arc<dyn GuestMemory>,
        sink: Arc<dyn InterruptSink>,
        bdf: u32,
    ) -> IommuResult<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            core: Mutex::new(CoreState::new(config.capabilities())),
            config,
            bdf,
            mem,
            sink,
            wakeup: Condvar::new(),
            stats: Mutex::new(IommuStats::new()),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("iommu-core".to_string())
            .spawn(move || worker.core_loop())
            .map_err(|e| IommuError::ThreadError(e.to_string()))?;

        log::info!(
            "iommu: realized at {} (caps={:#x})",
            DeviceId::from_bdf(crate::pci_bus_num(bdf), bdf as u8),
            shared.config.capabilities()
        );
        Ok(Self {
            shared,
            core_thread: Some(handle),
        })
    }

    /// 设备配置
    pub fn config(&self) -> &IommuConfig {
        &self.shared.config
    }

    /// IOMMU 自身的 requester ID
    pub fn bdf(&self) -> u32 {
        self.shared.bdf
    }

    /// 当前设备目录表模式
    pub fn ddt_mode(&self) -> DdtMode {
        self.shared.core.lock().ddt_mode
    }

    /// MMIO 读；窗口外或非法宽度返回全 1
    pub fn mmio_read(&self, offset: u64, size: u8) -> u64 {
        self.shared
            .core
            .lock()
            .regs
            .guest_read(offset, size)
            .unwrap_or(!0)
    }

    /// MMIO 写
    pub fn mmio_write(&self, offset: u64, val: u64, size: u8) {
        let effect = regs::write_effect(offset, u64::from(size));
        let action = {
            let mut core = self.shared.core.lock();
            if !core.regs.guest_write(offset, val, size) {
                log::debug!("iommu: ignored mmio write {:#x}/{}", offset, size);
                return;
            }
            match effect {
                WriteEffect::None => None,
                WriteEffect::Busy { reg, mask } => {
                    core.regs.set_bits_q(reg, mask);
                    self.shared.wakeup.notify_one();
                    None
                }
                WriteEffect::Doorbell => {
                    core.cq_tail_db = true;
                    self.shared.wakeup.notify_one();
                    None
                }
                WriteEffect::VectorControl(vector) => {
                    take_pending(&mut core.regs, vector).map(SinkAction::Notify)
                }
            }
        };
        if let Some(action) = action {
            self.shared.perform(action);
        }
    }

    /// 返回 `bus:devfn` 的 DMA 地址空间，首次调用时创建
    pub fn address_space(&self, bus: u8, devfn: u8) -> DeviceSpace {
        let devid = DeviceId::from_bdf(bus, devfn);
        let passthrough = devid.bits() == self.shared.bdf;
        if !passthrough {
            let mut core = self.shared.core.lock();
            if let Entry::Vacant(slot) = core.spaces.entry(devid) {
                slot.insert(ContextSlot::default());
                log::info!("iommu: new device address space {}", devid);
            }
        }
        DeviceSpace {
            shared: Arc::clone(&self.shared),
            devid,
            passthrough,
        }
    }

    /// 获取统计信息
    pub fn stats(&self) -> IommuStats {
        self.shared.stats.lock().clone()
    }

    /// 设备复位：寄存器恢复上电值，DDTP 回到 OFF，队列停用
    pub fn reset(&self) {
        let actions: Vec<SinkAction> = {
            let mut core = self.shared.core.lock();
            let released = [QueueKind::Command, QueueKind::Fault, QueueKind::PageRequest]
                .into_iter()
                .filter(|kind| core.regs.load_l(kind.control_reg()) & kind.active_bit() != 0)
                .map(|kind| SinkAction::VectorUnuse(irq_vector(&core.regs, kind.interrupt_source())))
                .collect();
            core.regs.reset(self.shared.config.capabilities());
            core.ddt_mode = DdtMode::Off;
            core.ddt_base = 0;
            core.cq = QueueState::default();
            core.fq = QueueState::default();
            core.pq = QueueState::default();
            core.cq_tail_db = false;
            core.invalidate(None);
            released
        };
        for action in actions {
            self.shared.perform(action);
        }
    }

    /// 停止核心线程
    pub fn shutdown(&mut self) {
        let Some(handle) = self.core_thread.take() else {
            return;
        };
        self.shared.core.lock().stop = true;
        self.shared.wakeup.notify_all();
        if handle.join().is_err() {
            log::error!("iommu: core thread panicked");
        }
    }
}

impl Drop for IommuDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}
