//! 服务查找抽象接口

use async_trait::async_trait;
use infrastructure_common::{ActiveDescriptor, DependencyError, DependencyResult, Instance, Lookup};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// 服务查找器 trait
///
/// 描述符按排名从高到低、同排名按 ID 从小到大排序
pub trait ServiceLocator: Send + Sync {
    /// 注册表名称
    fn name(&self) -> &str;

    /// 注册表 ID，用于区分描述符归属
    fn locator_id(&self) -> u64;

    /// 获取满足条件的最优描述符
    fn get_best_descriptor(&self, lookup: &Lookup) -> DependencyResult<Option<Arc<ActiveDescriptor>>>;

    /// 获取满足条件的全部描述符
    fn get_all_descriptors(&self, lookup: &Lookup) -> DependencyResult<Vec<Arc<ActiveDescriptor>>>;

    /// 按描述符所属作用域获取或创建实例
    fn get_or_create(&self, descriptor: &Arc<ActiveDescriptor>) -> DependencyResult<Instance>;

    /// 获取最优描述符的实例，没有匹配时返回 `None`
    fn get_service(&self, lookup: &Lookup) -> DependencyResult<Option<Instance>>;

    /// 获取全部匹配描述符的实例
    fn get_all_services(&self, lookup: &Lookup) -> DependencyResult<Vec<Instance>>;

    /// 关闭注册表，销毁全部缓存实例
    fn shutdown(&self);

    /// 是否已关闭
    fn is_shutdown(&self) -> bool;
}

/// 服务查找扩展方法
pub trait ServiceLocatorExt: ServiceLocator {
    /// 获取并转换为具体类型
    fn get_service_as<T>(&self, lookup: &Lookup) -> DependencyResult<Option<Arc<T>>>
    where
        T: Any + Send + Sync,
    {
        match self.get_service(lookup)? {
            Some(instance) => downcast_instance(instance).map(Some),
            None => Ok(None),
        }
    }

    /// 获取必需服务并转换为具体类型，缺失时返回依赖未满足错误
    fn require_service<T>(&self, lookup: &Lookup) -> DependencyResult<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.get_service_as(lookup)?
            .ok_or_else(|| DependencyError::unsatisfied(lookup))
    }
}

impl<L: ServiceLocator + ?Sized> ServiceLocatorExt for L {}

/// 把服务实例转换为具体类型
pub fn downcast_instance<T>(instance: Instance) -> DependencyResult<Arc<T>>
where
    T: Any + Send + Sync,
{
    instance
        .downcast::<T>()
        .map_err(|_| DependencyError::TypeMismatch {
            type_name: std::any::type_name::<T>().to_string(),
        })
}

/// 描述符观察者 trait
#[async_trait]
pub trait ServiceWatcher: Send + Sync {
    /// 等待满足条件的描述符出现，超时返回 `None`
    async fn wait_for_descriptor(
        &self,
        lookup: &Lookup,
        timeout: Duration,
    ) -> DependencyResult<Option<Arc<ActiveDescriptor>>>;
}
