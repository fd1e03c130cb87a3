//! 作用域与生命周期状态

use crate::descriptor::ActiveDescriptor;
use crate::errors::DependencyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// 作用域类型
///
/// 决定实例的缓存策略
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ScopeKind {
    /// 单例 - 注册表生命周期内每个描述符最多一个实例
    Singleton,
    /// 每次查找都创建新实例，注册表不缓存
    #[default]
    PerLookup,
    /// 即时 - 绑定后由后台工作线程立即创建，解绑后销毁
    Immediate,
    /// 自定义作用域，按名称查找已注册的作用域上下文
    Custom(String),
}

impl ScopeKind {
    /// 作用域名称
    pub fn name(&self) -> &str {
        match self {
            Self::Singleton => "Singleton",
            Self::PerLookup => "PerLookup",
            Self::Immediate => "Immediate",
            Self::Custom(name) => name,
        }
    }

    /// 是否为即时作用域
    pub fn is_immediate(&self) -> bool {
        matches!(self, Self::Immediate)
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 即时作用域描述符的生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ImmediateState {
    /// 未开始
    #[default]
    Unstarted,
    /// 已排队等待创建
    QueuedCreate,
    /// 创建中
    Creating,
    /// 运行中
    Active,
    /// 已排队等待销毁
    QueuedDestroy,
    /// 销毁中
    Destroying,
    /// 已销毁（或创建在开始前被取消）
    Destroyed,
    /// 创建失败
    Failed,
}

impl ImmediateState {
    /// 是否为终止状态
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed | Self::Failed)
    }
}

/// 生命周期阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    /// 创建
    Create,
    /// 销毁
    Destroy,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Destroy => f.write_str("destroy"),
        }
    }
}

/// 即时作用域任务失败记录
///
/// 只投递给即时作用域错误处理器，不会传播到触发它的事务
#[derive(Debug)]
pub struct LifecycleFailure {
    /// 失败的描述符
    pub descriptor: Arc<ActiveDescriptor>,
    /// 失败阶段
    pub phase: LifecyclePhase,
    /// 失败原因
    pub cause: DependencyError,
    /// 发生时间
    pub occurred_at: chrono::DateTime<chrono::Utc>,
}

impl LifecycleFailure {
    /// 创建失败记录
    pub fn new(descriptor: Arc<ActiveDescriptor>, phase: LifecyclePhase, cause: DependencyError) -> Self {
        Self {
            descriptor,
            phase,
            cause,
            occurred_at: chrono::Utc::now(),
        }
    }
}

impl fmt::Display for LifecycleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "即时服务 {} (描述符 {}) {} 失败: {}",
            self.descriptor.implementation(),
            self.descriptor.id(),
            self.phase,
            self.cause
        )
    }
}
