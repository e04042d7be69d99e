//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为流式缓冲对外暴露的错误语义提供集中定义，调用方只需匹配一个枚举；
//! - 区分“局部可恢复”（缓冲 / 溢出相关）与“致命”（源失败、句柄已关闭、作用域终止）两类故障，
//!   便于上层决定重试、降级还是中止事件。
//!
//! ## 设计要求（What）
//! - 每个变体都有 `<领域>.<语义>` 形式的稳定错误码，见 [`codes`]；
//! - 源读取失败原样携带底层 [`io::Error`]，不做二次包装。

use std::{fmt, io};

use spark_buffer::PoolError;
use thiserror::Error;

use crate::ids::ScopeId;

/// 流式组件的统一返回类型。
pub type Result<T, E = StreamingError> = core::result::Result<T, E>;

/// 稳定错误码集合。
///
/// # 契约说明（What）
/// - 码值一经发布不得修改，日志、度量与告警规则均以其为检索键；
/// - 新增码值必须沿用 `streaming.<语义>` 前缀。
pub mod codes {
    /// 缓冲无法增长：段池配额或分配器耗尽。
    pub const RESOURCE_EXHAUSTED: &str = "streaming.resource_exhausted";
    /// 在已关闭的游标或提供者上执行了操作。
    pub const CLOSED_HANDLE: &str = "streaming.closed_handle";
    /// 单次数据源读取失败，或提供者因先前的失败而中毒。
    pub const SOURCE_READ_FAILURE: &str = "streaming.source_read_failure";
    /// 目标事件作用域已经终止。
    pub const SCOPE_TERMINATED: &str = "streaming.scope_terminated";
    /// 内存缓冲超过上限且未配置溢出汇。
    pub const BUFFER_SIZE_EXCEEDED: &str = "streaming.buffer_size_exceeded";
    /// 定位到已被释放的位置。
    pub const SEEK_OUT_OF_RANGE: &str = "streaming.seek_out_of_range";
    /// 溢出汇读写失败。
    pub const OVERFLOW_IO: &str = "streaming.overflow_io";
    /// 配置非法。
    pub const INVALID_CONFIG: &str = "streaming.invalid_config";
}

/// 出错句柄的种类，用于 [`StreamingError::ClosedHandle`] 的上下文。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum HandleKind {
    Cursor,
    Provider,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleKind::Cursor => f.write_str("cursor"),
            HandleKind::Provider => f.write_str("cursor provider"),
        }
    }
}

/// 流式组件错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把缓冲增长、句柄生命周期、源读取、作用域回收等路径上的异常收敛为一个枚举，
///   每个变体携带足以排障的上下文（句柄编号、位置、配额）；
/// - **契约 (What)**：
///   - 所有变体均为 `Send + Sync + 'static`；
///   - [`StreamingError::code`] 返回 [`codes`] 中的稳定码值；
///   - [`StreamingError::is_recoverable`] 为 `true` 的错误不会改变提供者状态，调用方可以在释放内存或
///     推进慢游标后重试同一操作；
/// - **风险 (Trade-offs)**：`SourceReadFailure` 在提供者中毒后会以相同的消息重建 `io::Error`，
///   原始错误的 `source()` 链只在第一次失败时可见。
#[derive(Debug, Error)]
pub enum StreamingError {
    /// 缓冲增长时段池拒绝分配。
    #[error("streaming buffer could not grow: {0}")]
    ResourceExhausted(#[from] PoolError),

    /// 句柄已关闭（显式关闭、所属提供者关闭或被回收）。
    #[error("{kind} {id} is closed")]
    ClosedHandle { kind: HandleKind, id: u64 },

    /// 单次数据源返回错误；之后同一提供者上的所有前沿读取都以同一消息失败。
    #[error("single-pass source failed: {0}")]
    SourceReadFailure(#[source] io::Error),

    /// 事件作用域已终止，无法再登记或使用其下的提供者。
    #[error("event scope {scope} has terminated")]
    ScopeTerminated { scope: ScopeId },

    /// 内存缓冲超过上限，且当前提供者没有可用的溢出汇。
    #[error(
        "in-memory buffer limit of {limit} units exceeded: {retained} retained, {requested} more requested"
    )]
    BufferSizeExceeded {
        limit: u64,
        retained: u64,
        requested: u64,
    },

    /// 请求的位置早于仍被保留的最旧位置。
    #[error("position {requested} has already been released; oldest retained position is {oldest}")]
    SeekOutOfRange { requested: u64, oldest: u64 },

    /// 溢出汇写入或回读失败。
    #[error("overflow sink I/O failed: {0}")]
    Overflow(#[source] io::Error),

    /// 配置校验失败。
    #[error("invalid streaming configuration: {0}")]
    InvalidConfig(String),
}

impl StreamingError {
    /// 稳定错误码，遵循 `<领域>.<语义>` 约定。
    pub fn code(&self) -> &'static str {
        match self {
            StreamingError::ResourceExhausted(_) => codes::RESOURCE_EXHAUSTED,
            StreamingError::ClosedHandle { .. } => codes::CLOSED_HANDLE,
            StreamingError::SourceReadFailure(_) => codes::SOURCE_READ_FAILURE,
            StreamingError::ScopeTerminated { .. } => codes::SCOPE_TERMINATED,
            StreamingError::BufferSizeExceeded { .. } => codes::BUFFER_SIZE_EXCEEDED,
            StreamingError::SeekOutOfRange { .. } => codes::SEEK_OUT_OF_RANGE,
            StreamingError::Overflow(_) => codes::OVERFLOW_IO,
            StreamingError::InvalidConfig(_) => codes::INVALID_CONFIG,
        }
    }

    /// 是否属于局部可恢复错误。
    ///
    /// 缓冲、溢出相关的失败不会消费数据源，也不会关闭任何句柄；
    /// 其余错误意味着句柄或提供者已经不可用。
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StreamingError::ResourceExhausted(_)
                | StreamingError::BufferSizeExceeded { .. }
                | StreamingError::Overflow(_)
        )
    }

    pub(crate) fn closed_cursor(id: u64) -> Self {
        StreamingError::ClosedHandle {
            kind: HandleKind::Cursor,
            id,
        }
    }

    pub(crate) fn closed_provider(id: u64) -> Self {
        StreamingError::ClosedHandle {
            kind: HandleKind::Provider,
            id,
        }
    }
}

/// 供 `std::io::Read` / `Seek` 适配使用：源与溢出错误原样返回，其余按语义映射到 `ErrorKind`。
impl From<StreamingError> for io::Error {
    fn from(err: StreamingError) -> Self {
        match err {
            StreamingError::SourceReadFailure(inner) | StreamingError::Overflow(inner) => inner,
            StreamingError::SeekOutOfRange { .. } => {
                io::Error::new(io::ErrorKind::InvalidInput, err)
            }
            StreamingError::ClosedHandle { .. } | StreamingError::ScopeTerminated { .. } => {
                io::Error::new(io::ErrorKind::NotConnected, err)
            }
            StreamingError::ResourceExhausted(_) | StreamingError::BufferSizeExceeded { .. } => {
                io::Error::new(io::ErrorKind::OutOfMemory, err)
            }
            StreamingError::InvalidConfig(_) => io::Error::other(err),
        }
    }
}
