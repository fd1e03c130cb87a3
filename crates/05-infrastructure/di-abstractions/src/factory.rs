//! 服务创建器的闭包包装
//!
//! 大多数服务不需要单独实现 [`ServiceCreator`]，用闭包即可

use infrastructure_common::{Arguments, BoxError, Dependency, Instance, ServiceCreator};
use std::any::Any;
use std::sync::Arc;

type CreateFn = dyn Fn(&Arguments) -> Result<Instance, BoxError> + Send + Sync;
type DestroyFn = dyn Fn(&Instance) -> Result<(), BoxError> + Send + Sync;

/// 闭包创建器
pub struct FnCreator {
    dependencies: Vec<Dependency>,
    create_fn: Box<CreateFn>,
    destroy_fn: Option<Box<DestroyFn>>,
}

impl FnCreator {
    /// 创建新的闭包创建器
    pub fn new<F>(create_fn: F) -> Self
    where
        F: Fn(&Arguments) -> Result<Instance, BoxError> + Send + Sync + 'static,
    {
        Self {
            dependencies: Vec::new(),
            create_fn: Box::new(create_fn),
            destroy_fn: None,
        }
    }

    /// 追加构造依赖
    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    /// 设置销毁回调
    pub fn on_destroy<F>(mut self, destroy_fn: F) -> Self
    where
        F: Fn(&Instance) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.destroy_fn = Some(Box::new(destroy_fn));
        self
    }

    /// 转为共享的创建器
    pub fn into_creator(self) -> Arc<dyn ServiceCreator> {
        Arc::new(self)
    }
}

impl ServiceCreator for FnCreator {
    fn dependencies(&self) -> Vec<Dependency> {
        self.dependencies.clone()
    }

    fn create(&self, args: &Arguments) -> Result<Instance, BoxError> {
        (self.create_fn)(args)
    }

    fn destroy(&self, instance: &Instance) -> Result<(), BoxError> {
        match &self.destroy_fn {
            Some(destroy_fn) => destroy_fn(instance),
            None => Ok(()),
        }
    }
}

/// 无依赖、不会失败的创建器
pub fn creator_fn<T, F>(create_fn: F) -> Arc<dyn ServiceCreator>
where
    T: Any + Send + Sync,
    F: Fn() -> T + Send + Sync + 'static,
{
    FnCreator::new(move |_| Ok(Arc::new(create_fn()) as Instance)).into_creator()
}
