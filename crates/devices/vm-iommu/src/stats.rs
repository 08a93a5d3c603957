//! IOMMU 统计信息

/// IOMMU 统计信息
#[derive(Debug, Clone, PartialEq)]
pub struct IommuStats {
    /// 总地址转换次数
    pub total_translations: u64,
    /// 直通转换次数（BARE 模式）
    pub passthrough: u64,
    /// 设备上下文缓存命中次数
    pub context_hits: u64,
    /// 设备上下文缓存未命中次数
    pub context_misses: u64,
    /// 设备上下文缓存命中率
    pub hit_rate: f64,
    /// 写入故障队列的记录数
    pub faults_reported: u64,
    /// 未能写入故障队列的记录数
    pub faults_dropped: u64,
    /// 总命令数
    pub total_commands: u64,
    /// 命令队列错误次数
    pub command_errors: u64,
    /// 中断次数
    pub interrupts: u64,
}

impl Default for IommuStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IommuStats {
    pub fn new() -> Self {
        Self {
            total_translations: 0,
            passthrough: 0,
            context_hits: 0,
            context_misses: 0,
            hit_rate: 0.0,
            faults_reported: 0,
            faults_dropped: 0,
            total_commands: 0,
            command_errors: 0,
            interrupts: 0,
        }
    }

    pub fn update_context_lookup(&mut self, hit: bool) {
        if hit {
            self.context_hits += 1;
        } else {
            self.context_misses += 1;
        }

        let lookups = self.context_hits + self.context_misses;
        self.hit_rate = if lookups > 0 {
            self.context_hits as f64 / lookups as f64
        } else {
            0.0
        };
    }
}

impl std::fmt::Display for IommuStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "IOMMU统计信息")?;
        writeln!(f, "  总转换次数: {}", self.total_translations)?;
        writeln!(f, "  直通次数: {}", self.passthrough)?;
        writeln!(f, "  上下文命中次数: {}", self.context_hits)?;
        writeln!(f, "  上下文未命中次数: {}", self.context_misses)?;
        writeln!(f, "  命中率: {:.2}%", self.hit_rate * 100.0)?;
        writeln!(f, "  故障记录数: {}", self.faults_reported)?;
        writeln!(f, "  丢弃故障数: {}", self.faults_dropped)?;
        writeln!(f, "  总命令数: {}", self.total_commands)?;
        writeln!(f, "  命令错误数: {}", self.command_errors)?;
        writeln!(f, "  中断次数: {}", self.interrupts)
    }
}
