//! 构造拦截抽象接口
//!
//! 拦截器按顺序组成调用链，每个拦截器可以在 `proceed` 前后插入逻辑、
//! 替换构造结果或直接返回错误

use infrastructure_common::{ActiveDescriptor, Arguments, BoxError, DescriptorId, Instance};
use std::sync::Arc;

/// 被拦截的构造器
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstructorRef {
    /// 描述符 ID
    pub descriptor_id: DescriptorId,
    /// 实现名称
    pub implementation: String,
}

impl ConstructorRef {
    /// 由描述符生成
    pub fn of(descriptor: &ActiveDescriptor) -> Self {
        Self {
            descriptor_id: descriptor.id(),
            implementation: descriptor.implementation().to_string(),
        }
    }
}

/// 一次构造调用
pub trait ConstructorInvocation {
    /// 被拦截的构造器
    fn constructor(&self) -> &ConstructorRef;

    /// 构造参数
    fn arguments(&self) -> &Arguments;

    /// 已构造的实例，`proceed` 成功前为 `None`
    fn this(&self) -> Option<&Instance>;

    /// 调用链中的下一个拦截器，链尾执行实际构造
    ///
    /// 重复调用返回同一个实例，不会再次构造
    fn proceed(&mut self) -> Result<Instance, BoxError>;
}

/// 构造拦截器 trait
pub trait ConstructorInterceptor: Send + Sync {
    /// 拦截构造
    fn construct(&self, invocation: &mut dyn ConstructorInvocation) -> Result<Instance, BoxError>;
}

/// 拦截服务 trait
///
/// 决定哪些描述符需要拦截以及使用哪些拦截器
pub trait InterceptionService: Send + Sync {
    /// 是否拦截该描述符
    fn matches(&self, descriptor: &ActiveDescriptor) -> bool;

    /// 该描述符的构造拦截器，按调用顺序排列
    fn constructor_interceptors(
        &self,
        descriptor: &ActiveDescriptor,
    ) -> Vec<Arc<dyn ConstructorInterceptor>>;
}
