//! # Dependency Injection Abstractions
//!
//! 服务注册表的抽象层，定义服务查找、作用域、构造拦截和变更通知的核心接口。
//!
//! ## 核心接口
//!
//! - [`ServiceLocator`] - 服务查找与实例获取
//! - [`ServiceWatcher`] - 异步等待描述符出现
//! - [`ScopeContext`] - 作用域实例缓存
//! - [`ConstructorInterceptor`] - 构造拦截
//! - [`ConfigurationListener`] - 描述符集合变更监听
//! - [`ErrorService`] - 构造与销毁失败处理

pub mod error_service;
pub mod factory;
pub mod interceptor;
pub mod listener;
pub mod registry;
pub mod resolver;
pub mod scope;

pub use error_service::*;
pub use factory::*;
pub use interceptor::*;
pub use listener::*;
pub use registry::*;
pub use resolver::*;
pub use scope::*;
