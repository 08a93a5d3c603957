//! IOMMU 集成测试
//!
//! 通过 MMIO 寄存器配置设备，在客户机内存中构造设备目录表、页表和队列，
//! 验证 DMA 转换、故障上报、命令处理与中断投递的端到端行为。

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vm_iommu::command::Command;
use vm_iommu::context::{DirectoryTable, tc};
use vm_iommu::interrupt::InterruptController;
use vm_iommu::msi::msiptp;
use vm_iommu::queue::encode_base;
use vm_iommu::regs::{
    REG_CAP, REG_CQ_BASE, REG_CQ_CONTROL, REG_CQ_HEAD, REG_CQ_TAIL, REG_DDTP, REG_FQ_BASE,
    REG_FQ_CONTROL, REG_FQ_HEAD, REG_FQ_TAIL, REG_IPSR, REG_IVEC, REG_MSI_ADDR_BASE,
    REG_MSI_CTRL_BASE, REG_MSI_DATA_BASE, REG_MSI_PBA_BASE, cq_ctrl, ddtp, fq_ctrl, msi_ctrl,
};
use vm_iommu::walk::{AtpMode, make_atp, make_pte, pte};
use vm_iommu::{
    AccessFlags, DdtMode, DeviceContext, FaultCause, FaultRecord, GuestMemory, GuestRam,
    IommuConfig, IommuDevice, IommuMemoryRegion, TransactionType,
};

use proptest::prelude::*;

const RAM_BASE: u64 = 0x8000_0000;
const RAM_SIZE: usize = 0x40_0000;
const DDT_BASE: u64 = RAM_BASE;
const CQ_BASE: u64 = RAM_BASE + 0x1_0000;
const FQ_BASE: u64 = RAM_BASE + 0x2_0000;
const FENCE_BASE: u64 = RAM_BASE + 0x3_0000;
const PT_ROOT: u64 = RAM_BASE + 0x10_0000;
const TARGET: u64 = RAM_BASE + 0x20_0000;

const IOMMU_BDF: u32 = 0x0008;
/// 被测设备 00:02.0
const DEV_DEVFN: u8 = 0x10;
const DEV_ID: u32 = 0x10;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

struct Harness {
    mem: Arc<GuestRam>,
    irq: Arc<InterruptController>,
    iommu: IommuDevice,
    cq_tail: u32,
    cq_mask: u32,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(IommuConfig::default())
    }

    fn with_config(config: IommuConfig) -> Self {
        init_logger();
        let mem = Arc::new(GuestRam::with_region(RAM_BASE, RAM_SIZE));
        let irq = Arc::new(InterruptController::default());
        let iommu = IommuDevice::new(config, mem.clone(), irq.clone(), IOMMU_BDF).unwrap();
        Self {
            mem,
            irq,
            iommu,
            cq_tail: 0,
            cq_mask: 0,
        }
    }

    fn write_ddtp(&self, val: u64) {
        self.iommu.mmio_write(REG_DDTP, val, 8);
        assert!(wait_until(|| self.iommu.mmio_read(REG_DDTP, 8) & ddtp::BUSY == 0));
    }

    fn set_ddt(&self, mode: DdtMode, base: u64) {
        self.write_ddtp((base >> 12) | (mode.bits() << ddtp::MODE_SHIFT));
    }

    fn write_control(&self, reg: u64, val: u32, busy: u32) {
        self.iommu.mmio_write(reg, u64::from(val), 4);
        assert!(wait_until(|| self.iommu.mmio_read(reg, 4) as u32 & busy == 0));
    }

    fn enable_cq(&mut self, entries_log2: u32, irq: bool) {
        self.iommu
            .mmio_write(REG_CQ_BASE, encode_base(CQ_BASE, entries_log2), 8);
        let mut ctrl = cq_ctrl::ENABLE;
        if irq {
            ctrl |= cq_ctrl::IRQ_ENABLE;
        }
        self.write_control(REG_CQ_CONTROL, ctrl, cq_ctrl::BUSY);
        assert_ne!(self.iommu.mmio_read(REG_CQ_CONTROL, 4) as u32 & cq_ctrl::ACTIVE, 0);
        self.cq_tail = 0;
        self.cq_mask = (1 << entries_log2) - 1;
    }

    fn enable_fq(&self, entries_log2: u32, irq: bool) {
        self.iommu
            .mmio_write(REG_FQ_BASE, encode_base(FQ_BASE, entries_log2), 8);
        let mut ctrl = fq_ctrl::ENABLE;
        if irq {
            ctrl |= fq_ctrl::IRQ_ENABLE;
        }
        self.write_control(REG_FQ_CONTROL, ctrl, fq_ctrl::BUSY);
        assert_ne!(self.iommu.mmio_read(REG_FQ_CONTROL, 4) as u32 & fq_ctrl::ACTIVE, 0);
    }

    /// 写入命令并敲门铃，不等待完成
    fn push_commands(&mut self, cmds: &[Command]) {
        for cmd in cmds {
            let addr = CQ_BASE + u64::from(self.cq_tail) * Command::SIZE as u64;
            self.mem.write(addr, &cmd.to_bytes()).unwrap();
            self.cq_tail = (self.cq_tail + 1) & self.cq_mask;
        }
        self.iommu.mmio_write(REG_CQ_TAIL, u64::from(self.cq_tail), 4);
    }

    /// 写入命令并等待 IOMMU 消费完毕
    fn submit(&mut self, cmds: &[Command]) {
        self.push_commands(cmds);
        let tail = u64::from(self.cq_tail);
        assert!(wait_until(|| self.iommu.mmio_read(REG_CQ_HEAD, 4) == tail));
    }

    fn write_context(&self, devid: u32, dc: &DeviceContext) {
        self.mem
            .write(DDT_BASE + u64::from(devid) * DeviceContext::SIZE as u64, &dc.to_bytes())
            .unwrap();
    }

    fn fault_record(&self, index: u64) -> (u64, u64, u64) {
        let addr = FQ_BASE + index * FaultRecord::SIZE as u64;
        (
            self.mem.read_u64(addr).unwrap(),
            self.mem.read_u64(addr + 16).unwrap(),
            self.mem.read_u64(addr + 24).unwrap(),
        )
    }

    fn fq_tail(&self) -> u64 {
        self.iommu.mmio_read(REG_FQ_TAIL, 4)
    }
}

/// 在 `root` 处建立 Sv39 三级页表，把 `iova` 所在页映射到 `pa`
fn map_sv39(mem: &GuestRam, root: u64, iova: u64, pa: u64, flags: u64) {
    let l1 = root + 0x1000;
    let l0 = root + 0x2000;
    let vpn = |level: u32| (iova >> (12 + 9 * level)) & 0x1ff;
    mem.write_u64(root + vpn(2) * 8, make_pte(l1, 0)).unwrap();
    mem.write_u64(l1 + vpn(1) * 8, make_pte(l0, 0)).unwrap();
    mem.write_u64(l0 + vpn(0) * 8, make_pte(pa, flags)).unwrap();
}

fn sv39_context() -> DeviceContext {
    DeviceContext {
        tc: tc::VALID,
        satp: make_atp(AtpMode::Sv39, 0, PT_ROOT),
        ..Default::default()
    }
}

// ============================================================================
// 上电状态与 DDTP 模式
// ============================================================================

#[test]
fn test_power_on_state() {
    let h = Harness::new();
    assert_eq!(h.iommu.ddt_mode(), DdtMode::Off);
    assert_eq!(h.iommu.mmio_read(REG_CAP, 8), h.iommu.config().capabilities());
    assert_eq!(h.iommu.mmio_read(REG_DDTP, 8), 0);
    assert_eq!(h.iommu.mmio_read(REG_CQ_CONTROL, 4), 0);
}

#[test]
fn test_dma_disabled_without_fault_queue() {
    let h = Harness::new();
    let space = h.iommu.address_space(0, DEV_DEVFN);
    let entry = space.translate(0x1000, AccessFlags::ReadOnly);
    assert!(!entry.is_mapped());
    assert_eq!(entry.perm, AccessFlags::None);

    let stats = h.iommu.stats();
    assert_eq!(stats.total_translations, 1);
    assert_eq!(stats.faults_reported, 0);
    assert_eq!(stats.faults_dropped, 1);
}

#[test]
fn test_dma_disabled_fault_record() {
    let h = Harness::new();
    h.enable_fq(4, false);

    let space = h.iommu.address_space(0, DEV_DEVFN);
    let entry = space.translate(0x5000, AccessFlags::WriteOnly);
    assert!(!entry.is_mapped());

    assert_eq!(h.fq_tail(), 1);
    let (reason, iova, phys) = h.fault_record(0);
    assert_eq!(FaultRecord::cause_of(reason), FaultCause::DmaDisabled.code());
    assert_eq!(FaultRecord::devid_of(reason), DEV_ID);
    assert_eq!(
        FaultRecord::ttyp_of(reason),
        TransactionType::UntranslatedWrite.code()
    );
    assert_eq!(iova, 0x5000);
    assert_eq!(phys, 0);
    assert_eq!(h.iommu.stats().faults_reported, 1);
}

#[test]
fn test_bare_passthrough() {
    let h = Harness::new();
    h.set_ddt(DdtMode::Bare, 0);
    assert_eq!(h.iommu.ddt_mode(), DdtMode::Bare);

    let space = h.iommu.address_space(0, DEV_DEVFN);
    let entry = space.translate(0xdead_b000, AccessFlags::ReadWrite);
    assert_eq!(entry.translated_addr, 0xdead_b000);
    assert_eq!(entry.addr_mask, !0);
    assert_eq!(entry.perm, AccessFlags::ReadWrite);
    assert_eq!(h.iommu.stats().passthrough, 1);
}

#[test]
fn test_own_requester_is_never_translated() {
    let h = Harness::new();
    h.enable_fq(4, false);
    let space = h.iommu.address_space(0, IOMMU_BDF as u8);
    assert!(space.is_passthrough());
    let entry = space.translate(FQ_BASE, AccessFlags::WriteOnly);
    assert_eq!(entry.translated_addr, FQ_BASE);
    assert_eq!(h.fq_tail(), 0);
}

#[test]
fn test_rejected_ddtp_transition() {
    let h = Harness::new();
    h.set_ddt(DdtMode::OneLevel, DDT_BASE);
    let expected = (DDT_BASE >> 12) | (DdtMode::OneLevel.bits() << ddtp::MODE_SHIFT);
    assert_eq!(h.iommu.mmio_read(REG_DDTP, 8), expected);

    // 目录模式之间不能直接切换
    h.set_ddt(DdtMode::ThreeLevel, RAM_BASE + 0x5000);
    assert_eq!(h.iommu.ddt_mode(), DdtMode::OneLevel);
    assert_eq!(h.iommu.mmio_read(REG_DDTP, 8), expected);

    // 非法模式值
    h.write_ddtp(7 << ddtp::MODE_SHIFT);
    assert_eq!(h.iommu.mmio_read(REG_DDTP, 8), expected);

    // 经过 OFF 后允许
    h.set_ddt(DdtMode::Off, 0);
    h.set_ddt(DdtMode::ThreeLevel, RAM_BASE + 0x5000);
    assert_eq!(h.iommu.ddt_mode(), DdtMode::ThreeLevel);
}

// ============================================================================
// 设备目录表与页表转换
// ============================================================================

#[test]
fn test_sv39_translation() {
    let h = Harness::new();
    h.enable_fq(4, false);
    map_sv39(&h.mem, PT_ROOT, 0x4000_1000, TARGET, pte::R | pte::W);
    h.write_context(DEV_ID, &sv39_context());
    h.set_ddt(DdtMode::OneLevel, DDT_BASE);

    let space = h.iommu.address_space(0, DEV_DEVFN);
    let entry = space.translate(0x4000_1234, AccessFlags::ReadWrite);
    assert_eq!(entry.iova, 0x4000_1234);
    assert_eq!(entry.translated_addr, TARGET + 0x234);
    assert_eq!(entry.addr_mask, 0xfff);
    assert_eq!(entry.perm, AccessFlags::ReadWrite);

    // 第二次命中设备上下文缓存
    let entry = space.translate(0x4000_1010, AccessFlags::ReadOnly);
    assert_eq!(entry.translated_addr, TARGET + 0x10);
    let stats = h.iommu.stats();
    assert_eq!(stats.context_misses, 1);
    assert_eq!(stats.context_hits, 1);

    // 未映射的页
    let entry = space.translate(0x4000_5000, AccessFlags::ReadOnly);
    assert!(!entry.is_mapped());
    let (reason, iova, _) = h.fault_record(0);
    assert_eq!(FaultRecord::cause_of(reason), FaultCause::PdtInvalid.code());
    assert_eq!(
        FaultRecord::ttyp_of(reason),
        TransactionType::UntranslatedRead.code()
    );
    assert_eq!(iova, 0x4000_5000);
}

#[test]
fn test_stage_two_only_translation() {
    let config = IommuConfig {
        stage_one: false,
        stage_two: true,
        ..Default::default()
    };
    let h = Harness::with_config(config);
    map_sv39(&h.mem, PT_ROOT, 0x4000_1000, TARGET, pte::R);
    h.write_context(
        DEV_ID,
        &DeviceContext {
            tc: tc::VALID,
            gatp: make_atp(AtpMode::Sv39, 0, PT_ROOT),
            ..Default::default()
        },
    );
    h.set_ddt(DdtMode::OneLevel, DDT_BASE);

    let space = h.iommu.address_space(0, DEV_DEVFN);
    let entry = space.translate(0x4000_1100, AccessFlags::ReadOnly);
    assert_eq!(entry.translated_addr, TARGET + 0x100);
    // 只读页拒绝写
    assert!(!space.translate(0x4000_1100, AccessFlags::WriteOnly).is_mapped());
}

#[test]
fn test_write_to_read_only_page() {
    let h = Harness::new();
    h.enable_fq(4, false);
    map_sv39(&h.mem, PT_ROOT, 0x4000_1000, TARGET, pte::R);
    h.write_context(DEV_ID, &sv39_context());
    h.set_ddt(DdtMode::OneLevel, DDT_BASE);

    let space = h.iommu.address_space(0, DEV_DEVFN);
    assert!(!space.translate(0x4000_1000, AccessFlags::WriteOnly).is_mapped());
    let (reason, _, _) = h.fault_record(0);
    assert_eq!(
        FaultRecord::cause_of(reason),
        FaultCause::GuestPageFaultWrite.code()
    );
}

#[test]
fn test_invalid_device_context() {
    let h = Harness::new();
    h.enable_fq(4, false);
    h.set_ddt(DdtMode::OneLevel, DDT_BASE);

    // 00:02.0 的设备上下文未置有效位
    let space = h.iommu.address_space(0, DEV_DEVFN);
    assert!(!space.translate(0x1000, AccessFlags::ReadOnly).is_mapped());
    // 01:00.0 超出一级目录表范围
    let far = h.iommu.address_space(1, 0);
    assert!(!far.translate(0x1000, AccessFlags::ReadOnly).is_mapped());

    assert_eq!(h.fq_tail(), 2);
    let (reason, _, _) = h.fault_record(0);
    assert_eq!(FaultRecord::cause_of(reason), FaultCause::DdtInvalid.code());
    let (reason, _, _) = h.fault_record(1);
    assert_eq!(FaultRecord::cause_of(reason), FaultCause::DdtInvalid.code());
    assert_eq!(FaultRecord::devid_of(reason), 0x100);
}

#[test]
fn test_fault_reporting_disabled_by_context() {
    let h = Harness::new();
    h.enable_fq(4, false);
    h.write_context(
        DEV_ID,
        &DeviceContext {
            tc: tc::VALID | tc::DIS_TRANS_FAULT,
            ..sv39_context()
        },
    );
    h.set_ddt(DdtMode::OneLevel, DDT_BASE);

    let space = h.iommu.address_space(0, DEV_DEVFN);
    assert!(!space.translate(0x4000_0000, AccessFlags::ReadOnly).is_mapped());
    assert_eq!(h.fq_tail(), 0);
}

#[test]
fn test_process_directory_unsupported() {
    let h = Harness::new();
    h.enable_fq(4, false);
    h.write_context(
        DEV_ID,
        &DeviceContext {
            tc: tc::VALID | tc::PDTV,
            ..Default::default()
        },
    );
    h.set_ddt(DdtMode::OneLevel, DDT_BASE);

    let space = h.iommu.address_space(0, DEV_DEVFN);
    assert!(!space.translate(0x4000_0000, AccessFlags::ReadOnly).is_mapped());
    let (reason, _, _) = h.fault_record(0);
    assert_eq!(FaultRecord::cause_of(reason), FaultCause::PdtUnsupported.code());
}

// ============================================================================
// MSI 窗口
// ============================================================================

#[test]
fn test_msi_window_remap() {
    let h = Harness::new();
    h.enable_fq(4, false);
    h.write_context(
        DEV_ID,
        &DeviceContext {
            tc: tc::VALID,
            msiptp: msiptp::VALID,
            msi_addr_mask: 0x3,
            msi_addr_pattern: 0x2_8000,
            ..Default::default()
        },
    );
    h.set_ddt(DdtMode::OneLevel, DDT_BASE);
    let space = h.iommu.address_space(0, DEV_DEVFN);

    // 窗口内写入直通，粒度为页
    let entry = space.translate(0x2800_3000, AccessFlags::WriteOnly);
    assert_eq!(entry.translated_addr, 0x2800_3000);
    assert_eq!(entry.addr_mask, 0xfff);
    assert_eq!(entry.perm, AccessFlags::WriteOnly);

    // 窗口内读取
    assert!(!space.translate(0x2800_0000, AccessFlags::ReadOnly).is_mapped());
    let (reason, iova, _) = h.fault_record(0);
    assert_eq!(FaultRecord::cause_of(reason), FaultCause::MrifFault.code());
    assert_eq!(iova, 0x2800_0000);

    // 窗口外的地址走页表（satp 为 BARE）
    let entry = space.translate(0x2800_4000, AccessFlags::ReadOnly);
    assert_eq!(entry.translated_addr, 0x2800_4000);
    assert_eq!(entry.addr_mask, 0xfff);
}

#[test]
fn test_msi_window_ignored_without_msi_support() {
    let config = IommuConfig {
        msi: false,
        ..Default::default()
    };
    let h = Harness::with_config(config);
    // 基本格式设备上下文为 32 字节
    h.mem
        .write(
            DDT_BASE + u64::from(DEV_ID) * DeviceContext::BASE_SIZE as u64,
            &DeviceContext {
                tc: tc::VALID,
                ..Default::default()
            }
            .to_bytes()[..DeviceContext::BASE_SIZE],
        )
        .unwrap();
    h.set_ddt(DdtMode::OneLevel, DDT_BASE);

    let space = h.iommu.address_space(0, DEV_DEVFN);
    let entry = space.translate(0x0000_0800, AccessFlags::ReadOnly);
    assert_eq!(entry.translated_addr, 0x800);
    assert_eq!(entry.perm, AccessFlags::ReadOnly);
}

// ============================================================================
// 命令队列
// ============================================================================

#[test]
fn test_iofence_completion_and_interrupt() {
    let mut h = Harness::new();
    h.iommu.mmio_write(REG_MSI_ADDR_BASE, 0x2800_0000, 8);
    h.iommu.mmio_write(REG_MSI_DATA_BASE, 0x42, 4);
    h.enable_cq(4, true);
    assert!(wait_until(|| h.irq.vector_in_use(0)));

    h.submit(&[Command::iofence(Some((FENCE_BASE, 0xcafe)))]);
    assert_eq!(h.mem.read_u32(FENCE_BASE).unwrap(), 0xcafe);

    assert!(wait_until(|| h.irq.has_pending_interrupts()));
    let record = h.irq.get_next_interrupt().unwrap();
    assert_eq!(record.message.vector, 0);
    assert_eq!(record.message.address, 0x2800_0000);
    assert_eq!(record.message.data, 0x42);
    assert_eq!(h.iommu.mmio_read(REG_IPSR, 4) & 1, 1);
}

#[test]
fn test_command_queue_wraparound() {
    let mut h = Harness::new();
    h.enable_cq(2, false);

    let fences: Vec<Command> = (0..3u32)
        .map(|i| Command::iofence(Some((FENCE_BASE + u64::from(i) * 4, i + 1))))
        .collect();
    h.submit(&fences);
    assert_eq!(h.iommu.mmio_read(REG_CQ_HEAD, 4), 3);

    // 第 4、5 条跨越队列末尾
    let fences: Vec<Command> = (3..5u32)
        .map(|i| Command::iofence(Some((FENCE_BASE + u64::from(i) * 4, i + 1))))
        .collect();
    h.submit(&fences);
    assert_eq!(h.iommu.mmio_read(REG_CQ_HEAD, 4), 1);

    for i in 0..5u64 {
        assert_eq!(h.mem.read_u32(FENCE_BASE + i * 4).unwrap(), i as u32 + 1);
    }
    assert_eq!(h.iommu.stats().total_commands, 5);
}

#[test]
fn test_tail_write_limited_to_queue_size() {
    let mut h = Harness::new();
    h.enable_cq(2, false);
    // tail 只有低 2 位可写
    h.iommu.mmio_write(REG_CQ_TAIL, 0xff, 4);
    assert_eq!(h.iommu.mmio_read(REG_CQ_TAIL, 4), 0x3);
}

#[test]
fn test_illegal_command_stops_queue() {
    let mut h = Harness::new();
    h.enable_cq(4, false);
    h.push_commands(&[Command {
        request: 0x3ff,
        address: 0,
    }]);

    assert!(wait_until(|| {
        h.iommu.mmio_read(REG_CQ_CONTROL, 4) as u32 & cq_ctrl::ERROR != 0
    }));
    assert_eq!(h.iommu.mmio_read(REG_CQ_HEAD, 4), 0);
    assert_eq!(h.iommu.stats().command_errors, 1);

    // 写 1 清除错误位
    h.write_control(
        REG_CQ_CONTROL,
        cq_ctrl::ENABLE | cq_ctrl::ERROR,
        cq_ctrl::BUSY,
    );
    let ctrl = h.iommu.mmio_read(REG_CQ_CONTROL, 4) as u32;
    assert_eq!(ctrl & cq_ctrl::ERROR, 0);
    assert_ne!(ctrl & cq_ctrl::ACTIVE, 0);
}

#[test]
fn test_inval_ddt_refreshes_context() {
    let mut h = Harness::new();
    map_sv39(&h.mem, PT_ROOT, 0x4000_1000, TARGET, pte::R | pte::W);
    h.write_context(DEV_ID, &sv39_context());
    h.set_ddt(DdtMode::OneLevel, DDT_BASE);
    h.enable_cq(4, false);

    let space = h.iommu.address_space(0, DEV_DEVFN);
    assert!(space.translate(0x4000_1000, AccessFlags::ReadOnly).is_mapped());

    // 客户机使设备上下文无效，缓存仍然生效
    h.write_context(DEV_ID, &DeviceContext::default());
    assert!(space.translate(0x4000_1000, AccessFlags::ReadOnly).is_mapped());

    h.submit(&[
        Command::inval_ddt(Some(DEV_ID)),
        Command::iofence(Some((FENCE_BASE, 1))),
    ]);
    assert_eq!(h.mem.read_u32(FENCE_BASE).unwrap(), 1);
    assert!(!space.translate(0x4000_1000, AccessFlags::ReadOnly).is_mapped());

    // 重复失效没有副作用
    h.write_context(DEV_ID, &sv39_context());
    h.submit(&[Command::inval_ddt(Some(DEV_ID)), Command::inval_ddt(None)]);
    assert!(space.translate(0x4000_1000, AccessFlags::ReadOnly).is_mapped());
}

#[test]
fn test_ddtp_change_invalidates_contexts() {
    let h = Harness::new();
    map_sv39(&h.mem, PT_ROOT, 0x4000_1000, TARGET, pte::R);
    h.write_context(DEV_ID, &sv39_context());
    h.set_ddt(DdtMode::OneLevel, DDT_BASE);

    let space = h.iommu.address_space(0, DEV_DEVFN);
    assert!(space.translate(0x4000_1000, AccessFlags::ReadOnly).is_mapped());

    h.write_context(DEV_ID, &DeviceContext::default());
    h.set_ddt(DdtMode::Bare, 0);
    h.set_ddt(DdtMode::OneLevel, DDT_BASE);
    assert!(!space.translate(0x4000_1000, AccessFlags::ReadOnly).is_mapped());
}

// ============================================================================
// 故障队列与中断
// ============================================================================

#[test]
fn test_fault_queue_full() {
    let h = Harness::new();
    h.enable_fq(2, false);
    let space = h.iommu.address_space(0, DEV_DEVFN);

    for i in 0..5u64 {
        space.translate(i * 0x1000, AccessFlags::ReadOnly);
    }
    assert_eq!(h.fq_tail(), 3);
    assert_ne!(h.iommu.mmio_read(REG_FQ_CONTROL, 4) as u32 & fq_ctrl::FULL, 0);
    let stats = h.iommu.stats();
    assert_eq!(stats.faults_reported, 3);
    assert_eq!(stats.faults_dropped, 2);

    // 客户机消费全部记录后恢复
    h.iommu.mmio_write(REG_FQ_HEAD, 3, 4);
    space.translate(0x9000, AccessFlags::ReadOnly);
    assert_eq!(h.fq_tail(), 0);
    assert_eq!(h.iommu.mmio_read(REG_FQ_CONTROL, 4) as u32 & fq_ctrl::FULL, 0);
    let (_, iova, _) = h.fault_record(3);
    assert_eq!(iova, 0x9000);
}

#[test]
fn test_fault_queue_overflow_raises_no_interrupt() {
    let h = Harness::new();
    h.enable_fq(2, true);
    let space = h.iommu.address_space(0, DEV_DEVFN);

    for i in 0..3u64 {
        space.translate(i * 0x1000, AccessFlags::ReadOnly);
    }
    // 只在 IPSR 上升沿投递一次
    assert!(h.irq.get_next_interrupt().is_some());
    assert!(!h.irq.has_pending_interrupts());

    h.iommu.mmio_write(REG_IPSR, 0b10, 4);
    space.translate(0x3000, AccessFlags::ReadOnly);
    assert_ne!(h.iommu.mmio_read(REG_FQ_CONTROL, 4) as u32 & fq_ctrl::FULL, 0);
    assert_eq!(h.iommu.mmio_read(REG_IPSR, 4) & 0b10, 0);
    assert!(!h.irq.has_pending_interrupts());
    assert_eq!(h.iommu.stats().interrupts, 1);
}

#[test]
fn test_fault_interrupt_masked_vector() {
    let h = Harness::new();
    // 故障队列映射到向量 1，并屏蔽该向量
    h.iommu.mmio_write(REG_IVEC, 1 << 4, 4);
    h.iommu.mmio_write(REG_MSI_ADDR_BASE + 16, 0x2800_1000, 8);
    h.iommu.mmio_write(REG_MSI_DATA_BASE + 16, 7, 4);
    h.iommu
        .mmio_write(REG_MSI_CTRL_BASE + 16, u64::from(msi_ctrl::MASKED), 4);
    h.enable_fq(4, true);
    assert!(wait_until(|| h.irq.vector_in_use(1)));

    let space = h.iommu.address_space(0, DEV_DEVFN);
    space.translate(0x1000, AccessFlags::ReadOnly);
    assert_eq!(h.iommu.mmio_read(REG_IPSR, 4) & 0b10, 0b10);
    assert_eq!(h.iommu.mmio_read(REG_MSI_PBA_BASE, 8), 0b10);
    assert!(!h.irq.has_pending_interrupts());

    // 解除屏蔽后投递挂起的消息
    h.iommu.mmio_write(REG_MSI_CTRL_BASE + 16, 0, 4);
    let record = h.irq.get_next_interrupt().unwrap();
    assert_eq!(record.message.vector, 1);
    assert_eq!(record.message.address, 0x2800_1000);
    assert_eq!(record.message.data, 7);
    assert_eq!(h.iommu.mmio_read(REG_MSI_PBA_BASE, 8), 0);

    // IPSR 未清除前不再产生中断
    space.translate(0x2000, AccessFlags::ReadOnly);
    assert!(!h.irq.has_pending_interrupts());
    h.iommu.mmio_write(REG_IPSR, 0b10, 4);
    space.translate(0x3000, AccessFlags::ReadOnly);
    assert!(h.irq.has_pending_interrupts());
    assert_eq!(h.iommu.stats().interrupts, 2);
}

#[test]
fn test_reset_releases_vectors() {
    let mut h = Harness::new();
    h.set_ddt(DdtMode::Bare, 0);
    h.enable_cq(4, true);
    assert!(wait_until(|| h.irq.vector_in_use(0)));

    h.iommu.reset();
    assert!(!h.irq.vector_in_use(0));
    assert_eq!(h.iommu.ddt_mode(), DdtMode::Off);
    assert_eq!(h.iommu.mmio_read(REG_DDTP, 8), 0);
    assert_eq!(h.iommu.mmio_read(REG_CQ_CONTROL, 4), 0);
    assert_eq!(h.iommu.mmio_read(REG_CAP, 8), h.iommu.config().capabilities());
}

#[test]
fn test_stats_display() {
    let h = Harness::new();
    h.set_ddt(DdtMode::Bare, 0);
    h.iommu
        .address_space(0, DEV_DEVFN)
        .translate(0, AccessFlags::ReadOnly);
    let text = h.iommu.stats().to_string();
    assert!(text.contains("IOMMU统计信息"));
    assert!(text.contains("直通次数: 1"));
}

#[test]
fn test_device_from_toml_config() {
    init_logger();
    let config = IommuConfig::from_toml("version = 3\nstage_two = false\n").unwrap();
    let mem = Arc::new(GuestRam::with_region(RAM_BASE, 0x1000));
    let irq = Arc::new(InterruptController::default());
    let iommu = IommuDevice::new(config, mem, irq, IOMMU_BDF).unwrap();
    assert_eq!(iommu.mmio_read(REG_CAP, 1), 3);
    assert_eq!(iommu.bdf(), IOMMU_BDF);
}

// ============================================================================
// 属性测试
// ============================================================================

// 属性测试: DDTP 读回值与模式转换规则一致
proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]
    #[test]
    fn prop_ddtp_transitions(steps in prop::collection::vec((0u64..8, 0u64..0x1000), 1..8)) {
        let h = Harness::new();
        let mut mode = DdtMode::Off;
        let mut base = 0u64;

        for (raw_mode, ppn) in steps {
            h.write_ddtp((raw_mode << ddtp::MODE_SHIFT) | ppn);
            if let Some(next) = DdtMode::from_bits(raw_mode).filter(|next| mode.can_transition_to(*next)) {
                mode = next;
                base = ppn << 12;
            }
            prop_assert_eq!(
                h.iommu.mmio_read(REG_DDTP, 8),
                (base >> 12) | (mode.bits() << ddtp::MODE_SHIFT)
            );
            prop_assert_eq!(h.iommu.ddt_mode(), mode);
        }
    }
}

// 属性测试: 超出目录表位宽的设备 ID 判为无效，范围内的访问到达内存
proptest! {
    #[test]
    fn prop_device_id_range(devid in 0u32..(1 << 24), level in 0usize..3, extended in any::<bool>()) {
        let mode = [DdtMode::OneLevel, DdtMode::TwoLevel, DdtMode::ThreeLevel][level];
        let table = DirectoryTable::new(RAM_BASE, mode, extended);
        let bits = table.device_id_bits().unwrap();
        let mem = GuestRam::new();

        let cause = table.fetch(&mem, devid).unwrap_err().cause;
        if u64::from(devid) >> bits != 0 {
            prop_assert_eq!(cause, FaultCause::DdtInvalid);
        } else {
            prop_assert_eq!(cause, FaultCause::DdtFault);
        }
    }
}
