//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 段池只会以两种方式失败：内存配额或分配器耗尽、请求容量超过最大等级；
//! - 两者都属于“局部可恢复”错误，调用方可以选择降级为直通模式或向上传播。

use thiserror::Error;

/// 段池操作的统一返回类型。
pub type Result<T, E = PoolError> = core::result::Result<T, E>;

/// 段池错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：区分“暂时性耗尽”与“请求本身不合法”，便于上层选择重试、降级或直接报错；
/// - **契约 (What)**：所有变体均为 `Send + Sync + 'static`，且错误发生时池内部状态保持不变；
/// - **风险 (Trade-offs)**：`Exhausted` 同时覆盖配额耗尽与分配器拒绝两类根因，
///   排障时需结合 `resident`/`limit` 字段判断。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum PoolError {
    /// 常驻内存已达配额或分配器拒绝分配。
    #[error(
        "segment pool exhausted: requested {requested} bytes with {resident} resident (limit {limit:?})"
    )]
    Exhausted {
        requested: usize,
        resident: usize,
        limit: Option<usize>,
    },

    /// 请求容量超过了最大容量等级。
    #[error("requested segment capacity {requested} exceeds the largest class {max}")]
    CapacityTooLarge { requested: usize, max: usize },
}

impl PoolError {
    /// 稳定错误码，遵循 `<领域>.<语义>` 约定。
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::Exhausted { .. } => "buffer.exhausted",
            PoolError::CapacityTooLarge { .. } => "buffer.capacity_too_large",
        }
    }
}
