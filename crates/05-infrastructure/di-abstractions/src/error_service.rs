//! 失败处理抽象接口

use infrastructure_common::{ActiveDescriptor, DependencyError, LifecycleFailure};
use std::fmt;
use std::sync::Arc;

/// 失败发生的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePhase {
    /// 创建实例
    Create,
    /// 销毁实例
    Destroy,
}

impl fmt::Display for FailurePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Destroy => f.write_str("destroy"),
        }
    }
}

/// 失败信息
#[derive(Debug)]
pub struct ErrorInformation<'a> {
    /// 失败阶段
    pub phase: FailurePhase,
    /// 相关描述符
    pub descriptor: Option<&'a Arc<ActiveDescriptor>>,
    /// 失败原因
    pub cause: &'a DependencyError,
}

/// 错误服务的处理结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureAction {
    /// 忽略，查找返回空
    #[default]
    Ignore,
    /// 把错误返回给调用方
    Rethrow,
}

/// 错误服务 trait
///
/// 注册表按注册顺序调用全部错误服务，任一返回 `Rethrow` 时错误传播给调用方
pub trait ErrorService: Send + Sync {
    /// 处理失败
    fn on_failure(&self, info: &ErrorInformation<'_>) -> FailureAction;
}

/// 即时作用域错误处理器 trait
///
/// 即时服务在后台创建和销毁，失败只能通过这里观察到
pub trait ImmediateErrorHandler: Send + Sync {
    /// 创建或销毁失败
    fn on_lifecycle_failure(&self, failure: &LifecycleFailure);
}
