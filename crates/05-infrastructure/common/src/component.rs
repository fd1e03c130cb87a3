//! 服务实例与创建器的基础定义
//!
//! 注册表本身不知道如何构造具体类型，构造逻辑由 [`ServiceCreator`] 提供：
//! 可以直接挂在描述符上，也可以按实现名称登记到注册表的实现目录中。

use crate::descriptor::Lookup;
use std::any::Any;
use std::sync::Arc;

/// 服务实例
pub type Instance = Arc<dyn Any + Send + Sync>;

/// 装箱的错误原因
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// 构造参数，与 [`ServiceCreator::dependencies`] 一一对应
///
/// 可选依赖未满足时对应位置为 `None`
pub type Arguments = [Option<Instance>];

/// 构造依赖声明
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// 查找条件
    pub lookup: Lookup,
    /// 是否允许缺失
    pub optional: bool,
}

impl Dependency {
    /// 创建必需依赖
    pub fn required(lookup: Lookup) -> Self {
        Self {
            lookup,
            optional: false,
        }
    }

    /// 创建可选依赖
    pub fn optional(lookup: Lookup) -> Self {
        Self {
            lookup,
            optional: true,
        }
    }
}

/// 服务创建器 trait
///
/// 对应描述符的构造器（`Class`）或工厂（`Factory`）
pub trait ServiceCreator: Send + Sync {
    /// 构造所需的依赖，按构造参数顺序排列
    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    /// 创建实例
    fn create(&self, args: &Arguments) -> Result<Instance, BoxError>;

    /// 销毁实例
    fn destroy(&self, _instance: &Instance) -> Result<(), BoxError> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn ServiceCreator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCreator")
            .field("dependencies", &self.dependencies())
            .finish()
    }
}
