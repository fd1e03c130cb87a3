//! # 服务注册表实现
//!
//! 提供描述符索引、服务注册表、动态配置事务、构造拦截链以及即时作用域管理。
//!
//! ```no_run
//! use di_abstractions::{creator_fn, ServiceLocatorExt};
//! use di_impl::ServiceLocatorImpl;
//! use infrastructure_common::{Descriptor, Lookup, ScopeKind};
//!
//! let locator = ServiceLocatorImpl::named("app");
//! let mut configuration = locator.create_dynamic_configuration();
//! configuration.bind(
//!     Descriptor::new("Clock")
//!         .in_scope(ScopeKind::Singleton)
//!         .with_creator(creator_fn(|| 42_u64)),
//! );
//! configuration.commit().unwrap();
//!
//! let value = locator.require_service::<u64>(&Lookup::contract("Clock")).unwrap();
//! assert_eq!(*value, 42);
//! ```

pub mod error_service;
pub mod immediate;
pub mod index;
pub mod interception;
pub mod locator;
pub mod scope;
pub mod transaction;

pub use error_service::{LoggingErrorService, LoggingImmediateErrorHandler, RethrowErrorService};
pub use immediate::ImmediateScopeManager;
pub use index::{DescriptorIndex, IndexKey, IndexedListData, SortKey};
pub use interception::construct;
pub use locator::ServiceLocatorImpl;
pub use scope::{PerLookupContext, SingletonContext};
pub use transaction::DynamicConfiguration;
