//! 构造拦截链
//!
//! 每次构造都新建一条调用链，链上的节点按下标指向下一个拦截器，
//! 最后一个节点执行实际构造。

use di_abstractions::{ConstructorInterceptor, ConstructorInvocation, ConstructorRef};
use infrastructure_common::{Arguments, BoxError, Instance};
use std::sync::Arc;

/// 实际构造
pub type Terminal<'a> = dyn FnMut(&Arguments) -> Result<Instance, BoxError> + 'a;

/// 执行构造，依次经过全部拦截器
///
/// 没有拦截器时直接调用 `terminal`
pub fn construct(
    constructor: &ConstructorRef,
    args: &Arguments,
    interceptors: &[Arc<dyn ConstructorInterceptor>],
    terminal: &mut Terminal<'_>,
) -> Result<Instance, BoxError> {
    if interceptors.is_empty() {
        return terminal(args);
    }

    let mut head = ChainedInvocation {
        constructor,
        args,
        interceptors,
        position: 0,
        terminal,
        this: None,
    };
    interceptors[0].construct(&mut head)
}

/// 调用链节点
///
/// `position` 是当前拦截器的下标；`proceed` 调用下一个拦截器或执行实际构造，
/// 结果缓存在节点上
struct ChainedInvocation<'a, 't> {
    constructor: &'a ConstructorRef,
    args: &'a Arguments,
    interceptors: &'a [Arc<dyn ConstructorInterceptor>],
    position: usize,
    terminal: &'a mut Terminal<'t>,
    this: Option<Instance>,
}

impl ConstructorInvocation for ChainedInvocation<'_, '_> {
    fn constructor(&self) -> &ConstructorRef {
        self.constructor
    }

    fn arguments(&self) -> &Arguments {
        self.args
    }

    fn this(&self) -> Option<&Instance> {
        self.this.as_ref()
    }

    fn proceed(&mut self) -> Result<Instance, BoxError> {
        if let Some(instance) = &self.this {
            return Ok(instance.clone());
        }

        let next = self.position + 1;
        let instance = if next < self.interceptors.len() {
            let mut node = ChainedInvocation {
                constructor: self.constructor,
                args: self.args,
                interceptors: self.interceptors,
                position: next,
                terminal: &mut *self.terminal,
                this: None,
            };
            self.interceptors[next].construct(&mut node)?
        } else {
            (self.terminal)(self.args)?
        };

        self.this = Some(instance.clone());
        Ok(instance)
    }
}
