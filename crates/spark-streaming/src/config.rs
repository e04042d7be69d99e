//! # config 模块说明
//!
//! ## 角色定位（Why）
//! - 汇总流式缓冲的全部可调参数：段池、字节缓冲、对象缓冲、回收线程；
//! - 所有结构体实现 `Deserialize` 且字段均有默认值，宿主可以从任意格式加载，只覆盖关心的字段。
//!
//! ## 契约（What）
//! - 每个配置都提供 `validate()`，失败时返回 [`StreamingError::InvalidConfig`]；
//! - 工厂在创建前会调用 `validate()`，非法配置不会生成任何提供者。

use std::{path::PathBuf, sync::Arc};

use serde::Deserialize;
use spark_buffer::PoolConfig;

use crate::{
    error::{Result, StreamingError},
    overflow::{OverflowSink, SharedOverflowSink},
};

/// 数据量单位。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataUnit {
    Byte,
    Kb,
    Mb,
    Gb,
}

impl DataUnit {
    /// 单位对应的字节倍数（二进制前缀）。
    pub fn multiplier(self) -> u64 {
        match self {
            DataUnit::Byte => 1,
            DataUnit::Kb => 1 << 10,
            DataUnit::Mb => 1 << 20,
            DataUnit::Gb => 1 << 30,
        }
    }
}

/// 带单位的数据量，例如 `{ amount = 256, unit = "KB" }`。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize)]
pub struct ByteSize {
    pub amount: u64,
    pub unit: DataUnit,
}

impl ByteSize {
    pub const fn new(amount: u64, unit: DataUnit) -> Self {
        Self { amount, unit }
    }

    pub const fn bytes(amount: u64) -> Self {
        Self::new(amount, DataUnit::Byte)
    }

    pub const fn kb(amount: u64) -> Self {
        Self::new(amount, DataUnit::Kb)
    }

    pub const fn mb(amount: u64) -> Self {
        Self::new(amount, DataUnit::Mb)
    }

    /// 换算为字节数，溢出时饱和到 `u64::MAX`。
    pub fn to_bytes(self) -> u64 {
        self.amount.saturating_mul(self.unit.multiplier())
    }
}

/// 缓冲保留策略。
///
/// - `TrailingCursors`：只保留最慢游标之后的数据，已被所有游标越过的区段立即释放；
/// - `Full`：保留从 0 开始的全部数据，直到提供者关闭，任何游标都可以回退到起点。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionPolicy {
    #[default]
    TrailingCursors,
    Full,
}

/// 超出内存上限后的去处。
///
/// `TempFile` 在首次溢出时于 `directory`（缺省为系统临时目录）创建匿名临时文件，
/// 文件随提供者关闭而删除。
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum OverflowMode {
    Disabled,
    TempFile {
        #[serde(default)]
        directory: Option<PathBuf>,
    },
}

impl Default for OverflowMode {
    fn default() -> Self {
        OverflowMode::TempFile { directory: None }
    }
}

/// 字节流缓冲配置。
///
/// # 教案式说明
/// - **意图 (Why)**：首段按 `initial_buffer_size` 分配、之后按 `buffer_size_increment` 增长，
///   小负载只占用一个段；超过 `max_in_memory_size` 的部分交给溢出汇；
/// - **契约 (What)**：
///   - 三个尺寸都必须大于 0，且 `initial_buffer_size <= max_in_memory_size`；
///   - `overflow_sink` 不参与反序列化，只能以代码注入（[`ByteStreamingConfig::with_overflow_sink`]），
///     注入后优先于 `overflow`；
/// - **风险 (Trade-offs)**：段尺寸最终会被取整到段池等级并截断到最大等级，
///   因此实际首段可能略大于配置值。
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ByteStreamingConfig {
    pub initial_buffer_size: ByteSize,
    pub buffer_size_increment: ByteSize,
    pub max_in_memory_size: ByteSize,
    pub overflow: OverflowMode,
    pub retention: RetentionPolicy,
    #[serde(skip)]
    pub overflow_sink: Option<SharedOverflowSink>,
}

impl Default for ByteStreamingConfig {
    fn default() -> Self {
        Self {
            initial_buffer_size: ByteSize::kb(256),
            buffer_size_increment: ByteSize::kb(256),
            max_in_memory_size: ByteSize::mb(1),
            overflow: OverflowMode::default(),
            retention: RetentionPolicy::default(),
            overflow_sink: None,
        }
    }
}

impl ByteStreamingConfig {
    /// 纯内存配置：关闭溢出，超过上限的读取以 `BufferSizeExceeded` 失败。
    pub fn in_memory(self) -> Self {
        Self {
            overflow: OverflowMode::Disabled,
            overflow_sink: None,
            ..self
        }
    }

    /// 注入共享溢出汇；多个提供者共用同一汇时各自只释放自己的令牌。
    pub fn with_overflow_sink(mut self, sink: Arc<dyn OverflowSink>) -> Self {
        self.overflow_sink = Some(SharedOverflowSink::new(sink));
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// 是否配置了任何溢出去处。
    pub fn overflow_enabled(&self) -> bool {
        self.overflow_sink.is_some() || !matches!(self.overflow, OverflowMode::Disabled)
    }

    pub fn validate(&self) -> Result<()> {
        let initial = self.initial_buffer_size.to_bytes();
        let increment = self.buffer_size_increment.to_bytes();
        let max = self.max_in_memory_size.to_bytes();
        if initial == 0 || increment == 0 || max == 0 {
            return Err(StreamingError::InvalidConfig(
                "byte buffer sizes must be greater than zero".into(),
            ));
        }
        if initial > max {
            return Err(StreamingError::InvalidConfig(format!(
                "initial_buffer_size ({initial} bytes) exceeds max_in_memory_size ({max} bytes)"
            )));
        }
        Ok(())
    }
}

/// 对象流缓冲配置，单位为“条目”。
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct ObjectStreamingConfig {
    pub initial_buffer_size: usize,
    pub buffer_size_increment: usize,
    pub max_in_memory_instances: usize,
    pub retention: RetentionPolicy,
}

impl Default for ObjectStreamingConfig {
    fn default() -> Self {
        Self {
            initial_buffer_size: 100,
            buffer_size_increment: 100,
            max_in_memory_instances: 1000,
            retention: RetentionPolicy::default(),
        }
    }
}

impl ObjectStreamingConfig {
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_buffer_size == 0
            || self.buffer_size_increment == 0
            || self.max_in_memory_instances == 0
        {
            return Err(StreamingError::InvalidConfig(
                "object buffer sizes must be greater than zero".into(),
            ));
        }
        if self.initial_buffer_size > self.max_in_memory_instances {
            return Err(StreamingError::InvalidConfig(format!(
                "initial_buffer_size ({}) exceeds max_in_memory_instances ({})",
                self.initial_buffer_size, self.max_in_memory_instances
            )));
        }
        Ok(())
    }
}

/// 回收队列的执行方式。
///
/// - `background = true`：启动名为 `thread_name` 的专用线程持续处理泄漏通知；
/// - `background = false`：通知留在队列中，由宿主调用 `CursorManager::run_reclamation` 处理。
#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReclamationConfig {
    pub background: bool,
    pub thread_name: String,
}

impl Default for ReclamationConfig {
    fn default() -> Self {
        Self {
            background: true,
            thread_name: "spark-streaming-reclaimer".into(),
        }
    }
}

impl ReclamationConfig {
    /// 不启动后台线程的配置，常用于测试。
    pub fn manual() -> Self {
        Self {
            background: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.background && self.thread_name.trim().is_empty() {
            return Err(StreamingError::InvalidConfig(
                "reclamation thread_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// 顶层配置。
///
/// `enabled = false` 时 [`StreamingManagerHandle::from_config`](crate::StreamingManagerHandle::from_config)
/// 选择空实现，其余字段被忽略。
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub enabled: bool,
    pub pool: PoolConfig,
    pub bytes: ByteStreamingConfig,
    pub objects: ObjectStreamingConfig,
    pub reclamation: ReclamationConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pool: PoolConfig::default(),
            bytes: ByteStreamingConfig::default(),
            objects: ObjectStreamingConfig::default(),
            reclamation: ReclamationConfig::default(),
        }
    }
}

impl StreamingConfig {
    pub fn validate(&self) -> Result<()> {
        self.pool
            .validate()
            .map_err(|err| StreamingError::InvalidConfig(format!("pool: {err}")))?;
        self.bytes.validate()?;
        self.objects.validate()?;
        self.reclamation.validate()
    }
}
