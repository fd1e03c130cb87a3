//! 错误类型定义

use crate::component::BoxError;
use crate::descriptor::DescriptorId;
use thiserror::Error;
use uuid::Uuid;

/// 配置错误类型
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("配置解析失败: {source}")]
    ParseError { source: BoxError },

    #[error("配置验证失败: {message}")]
    ValidationError { message: String },

    #[error("配置键不存在: {key}")]
    KeyNotFound { key: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(error: config::ConfigError) -> Self {
        match error {
            config::ConfigError::NotFound(key) => Self::KeyNotFound { key },
            other => Self::ParseError {
                source: Box::new(other),
            },
        }
    }
}

/// 注册表错误类型
///
/// 覆盖查找、提交、构造与销毁中的全部失败
#[derive(Error, Debug)]
pub enum DependencyError {
    #[error("依赖未满足: {lookup}")]
    UnsatisfiedDependency { lookup: String },

    #[error("描述符重复绑定: {implementation} ({identity})")]
    MultiBindingConflict { identity: Uuid, implementation: String },

    #[error("服务创建失败: {implementation} (描述符 {descriptor_id}), 原因: {source}")]
    ConstructionFailed {
        descriptor_id: DescriptorId,
        implementation: String,
        source: BoxError,
    },

    #[error("服务销毁失败: {implementation} (描述符 {descriptor_id}), 原因: {source}")]
    DestructionFailed {
        descriptor_id: DescriptorId,
        implementation: String,
        source: BoxError,
    },

    #[error("循环依赖检测到: {dependency_chain}")]
    CircularDependency { dependency_chain: String },

    #[error("作用域不存在: {scope}")]
    ScopeNotFound { scope: String },

    #[error("实现未注册: {implementation}")]
    ImplementationNotFound { implementation: String },

    #[error("实例类型不匹配: 期望 {type_name}")]
    TypeMismatch { type_name: String },

    #[error("描述符 {descriptor_id} 不属于注册表 {locator_id}")]
    ForeignDescriptor { descriptor_id: DescriptorId, locator_id: u64 },

    #[error("描述符 {descriptor_id} ({implementation}) 已解绑")]
    DescriptorNotBound {
        descriptor_id: DescriptorId,
        implementation: String,
    },

    #[error("描述符索引损坏: {message}")]
    IndexCorruption { message: String },

    #[error("配置事务已提交")]
    TransactionAlreadyCommitted,

    #[error("注册表已关闭: {locator}")]
    Shutdown { locator: String },
}

impl DependencyError {
    /// 创建依赖未满足错误
    pub fn unsatisfied(lookup: impl ToString) -> Self {
        Self::UnsatisfiedDependency {
            lookup: lookup.to_string(),
        }
    }

    /// 创建索引损坏错误
    pub fn index_corruption(message: impl Into<String>) -> Self {
        Self::IndexCorruption {
            message: message.into(),
        }
    }

    /// 是否为构造失败
    pub fn is_construction_failure(&self) -> bool {
        matches!(self, Self::ConstructionFailed { .. })
    }
}

/// 基础设施错误类型
#[derive(Error, Debug)]
pub enum InfrastructureError {
    #[error("配置错误: {source}")]
    ConfigError {
        #[from]
        source: ConfigError,
    },

    #[error("依赖注入错误: {source}")]
    DependencyError {
        #[from]
        source: DependencyError,
    },

    #[error("基础设施启动失败: {message}")]
    BootstrapFailed { message: String },
}

/// 结果类型别名
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type DependencyResult<T> = Result<T, DependencyError>;
pub type InfrastructureResult<T> = Result<T, InfrastructureError>;
