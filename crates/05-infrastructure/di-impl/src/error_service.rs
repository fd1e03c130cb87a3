//! 内置错误服务

use di_abstractions::{ErrorInformation, ErrorService, FailureAction, FailurePhase, ImmediateErrorHandler};
use infrastructure_common::LifecycleFailure;
use tracing::{error, warn};

/// 记录日志后继续
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingErrorService;

impl ErrorService for LoggingErrorService {
    fn on_failure(&self, info: &ErrorInformation<'_>) -> FailureAction {
        match info.descriptor {
            Some(descriptor) => warn!("服务 {} {} 失败: {}", descriptor, info.phase, info.cause),
            None => warn!("{} 失败: {}", info.phase, info.cause),
        }
        FailureAction::Ignore
    }
}

/// 把创建失败返回给调用方
#[derive(Debug, Default, Clone, Copy)]
pub struct RethrowErrorService;

impl ErrorService for RethrowErrorService {
    fn on_failure(&self, info: &ErrorInformation<'_>) -> FailureAction {
        match info.phase {
            FailurePhase::Create => FailureAction::Rethrow,
            FailurePhase::Destroy => FailureAction::Ignore,
        }
    }
}

/// 即时作用域默认错误处理器，只记录日志
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingImmediateErrorHandler;

impl ImmediateErrorHandler for LoggingImmediateErrorHandler {
    fn on_lifecycle_failure(&self, failure: &LifecycleFailure) {
        error!("{}", failure);
    }
}
