//! 作用域上下文抽象接口

use infrastructure_common::{ActiveDescriptor, DependencyResult, Instance, ScopeKind};
use std::sync::Arc;

/// 作用域上下文 trait
///
/// 负责某个作用域内实例的缓存与释放
pub trait ScopeContext: Send + Sync {
    /// 所管理的作用域
    fn scope(&self) -> ScopeKind;

    /// 查找已缓存的实例，不存在时调用 `create` 创建
    ///
    /// 并发调用时同一描述符最多创建一次成功的实例
    fn find_or_create(
        &self,
        descriptor: &Arc<ActiveDescriptor>,
        create: &mut dyn FnMut() -> DependencyResult<Instance>,
    ) -> DependencyResult<Instance>;

    /// 是否已缓存该描述符的实例
    fn contains(&self, descriptor: &ActiveDescriptor) -> bool;

    /// 移出单个描述符的实例，由调用方负责销毁
    fn destroy_one(&self, descriptor: &ActiveDescriptor) -> Option<Instance>;

    /// 移出全部实例，按创建顺序倒序排列
    fn drain(&self) -> Vec<(Arc<ActiveDescriptor>, Instance)>;

    /// 已缓存的实例数量
    fn len(&self) -> usize;

    /// 是否为空
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
