//! 客户机物理内存访问接口
//!
//! IOMMU 通过该接口读取设备目录表、页表和命令队列，写入故障队列和
//! IOFENCE 完成数据。访问失败返回 `IommuError::MemoryAccess`，由调用方
//! 映射为对应的故障原因。

use parking_lot::RwLock;

use crate::error::{IommuError, IommuResult};

/// 客户机物理内存（同步 DMA 读写原语）
pub trait GuestMemory: Send + Sync {
    /// 从 `addr` 读取 `buf.len()` 字节
    fn read(&self, addr: u64, buf: &mut [u8]) -> IommuResult<()>;

    /// 向 `addr` 写入 `buf`
    fn write(&self, addr: u64, buf: &[u8]) -> IommuResult<()>;

    fn read_u32(&self, addr: u64) -> IommuResult<u32> {
        let mut bytes = [0u8; 4];
        self.read(addr, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_u64(&self, addr: u64) -> IommuResult<u64> {
        let mut bytes = [0u8; 8];
        self.read(addr, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn write_u32(&self, addr: u64, val: u32) -> IommuResult<()> {
        self.write(addr, &val.to_le_bytes())
    }

    fn write_u64(&self, addr: u64, val: u64) -> IommuResult<()> {
        self.write(addr, &val.to_le_bytes())
    }
}

/// 内存区域
#[derive(Debug)]
struct MemoryRegion {
    /// 起始地址
    start: u64,
    /// 内存数据
    data: Vec<u8>,
}

impl MemoryRegion {
    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    // 返回区域内偏移，访问必须完整落在区域内
    fn offset_of(&self, addr: u64, len: usize) -> Option<usize> {
        let end = addr.checked_add(len as u64)?;
        if addr >= self.start && end <= self.end() {
            Some((addr - self.start) as usize)
        } else {
            None
        }
    }
}

/// 基于内存区域的客户机 RAM
///
/// 未被任何区域覆盖的地址访问失败，可用于模拟总线访问错误。
#[derive(Debug, Default)]
pub struct GuestRam {
    regions: RwLock<Vec<MemoryRegion>>,
}

impl GuestRam {
    /// 创建空的客户机 RAM
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建一个从 `start` 开始、大小为 `size` 的 RAM
    pub fn with_region(start: u64, size: usize) -> Self {
        let ram = Self::new();
        ram.add_region(start, size);
        ram
    }

    /// 添加清零的内存区域
    pub fn add_region(&self, start: u64, size: usize) {
        self.regions.write().push(MemoryRegion {
            start,
            data: vec![0u8; size],
        });
    }

    fn access_error(addr: u64, len: usize) -> IommuError {
        IommuError::MemoryAccess { addr, len }
    }
}

impl GuestMemory for GuestRam {
    fn read(&self, addr: u64, buf: &mut [u8]) -> IommuResult<()> {
        let regions = self.regions.read();
        let (region, offset) = regions
            .iter()
            .find_map(|r| r.offset_of(addr, buf.len()).map(|off| (r, off)))
            .ok_or_else(|| Self::access_error(addr, buf.len()))?;
        buf.copy_from_slice(&region.data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&self, addr: u64, buf: &[u8]) -> IommuResult<()> {
        let mut regions = self.regions.write();
        let (region, offset) = regions
            .iter_mut()
            .find_map(|r| r.offset_of(addr, buf.len()).map(|off| (r, off)))
            .ok_or_else(|| Self::access_error(addr, buf.len()))?;
        region.data[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}
