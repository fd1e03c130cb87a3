//! 组合层与服务注册表的集中集成测试

use di_abstractions::{
    creator_fn, downcast_instance, ChangeSet, ConfigurationListener, FnCreator, ScopeContext, ServiceLocator,
    ServiceLocatorExt, ServiceWatcher,
};
use di_impl::LoggingErrorService;
use infrastructure_common::{
    ActiveDescriptor, Dependency, DependencyError, DependencyResult, Descriptor, Instance, Lookup, ScopeKind,
};
use infrastructure_composition::{InfrastructureError, LoggingConfig, RegistryBuilder};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

static INIT: Once = Once::new();

/// 初始化测试日志
fn init_logging() {
    INIT.call_once(|| {
        LoggingConfig::default().init();
    });
}

/// 连接池依赖的仓储
fn repository_descriptor() -> Descriptor {
    let creator = FnCreator::new(|args| {
        let pool = args[0].clone().ok_or("缺少连接池")?;
        let pool = downcast_instance::<String>(pool)?;
        Ok(Arc::new(format!("repository({})", pool)) as Instance)
    })
    .with_dependency(Dependency::required(Lookup::contract("Pool")))
    .into_creator();

    Descriptor::new("SqlRepository")
        .to("Repository")
        .in_scope(ScopeKind::Singleton)
        .with_creator(creator)
}

/// 按描述符缓存实例的请求作用域
struct RequestScope {
    instances: Mutex<Vec<(Arc<ActiveDescriptor>, Instance)>>,
}

impl RequestScope {
    fn new() -> Self {
        Self {
            instances: Mutex::new(Vec::new()),
        }
    }
}

impl ScopeContext for RequestScope {
    fn scope(&self) -> ScopeKind {
        ScopeKind::Custom("request".to_string())
    }

    fn find_or_create(
        &self,
        descriptor: &Arc<ActiveDescriptor>,
        create: &mut dyn FnMut() -> DependencyResult<Instance>,
    ) -> DependencyResult<Instance> {
        if let Some((_, instance)) = self.instances.lock().iter().find(|(d, _)| d.id() == descriptor.id()) {
            return Ok(instance.clone());
        }
        let instance = create()?;
        self.instances.lock().push((descriptor.clone(), instance.clone()));
        Ok(instance)
    }

    fn contains(&self, descriptor: &ActiveDescriptor) -> bool {
        self.instances.lock().iter().any(|(d, _)| d.id() == descriptor.id())
    }

    fn destroy_one(&self, descriptor: &ActiveDescriptor) -> Option<Instance> {
        let mut instances = self.instances.lock();
        let position = instances.iter().position(|(d, _)| d.id() == descriptor.id())?;
        Some(instances.remove(position).1)
    }

    fn drain(&self) -> Vec<(Arc<ActiveDescriptor>, Instance)> {
        let mut instances = std::mem::take(&mut *self.instances.lock());
        instances.reverse();
        instances
    }

    fn len(&self) -> usize {
        self.instances.lock().len()
    }
}

/// 记录收到的提交序号
#[derive(Default)]
struct SequenceListener {
    sequences: Mutex<Vec<u64>>,
}

impl ConfigurationListener for SequenceListener {
    fn name(&self) -> &str {
        "sequence-listener"
    }

    fn configuration_changed(&self, changes: &ChangeSet) {
        self.sequences.lock().push(changes.sequence);
    }
}

#[test]
fn test_builder_resolves_dependencies() -> anyhow::Result<()> {
    init_logging();
    let locator = RegistryBuilder::new()
        .add_descriptor(Descriptor::new("Pool").with_creator(creator_fn(|| "pg".to_string())))
        .add_descriptor(repository_descriptor())
        .build()?;

    let repository = locator.require_service::<String>(&Lookup::contract("Repository"))?;
    assert_eq!(repository.as_str(), "repository(pg)");

    let again = locator.require_service::<String>(&Lookup::contract("Repository"))?;
    assert!(Arc::ptr_eq(&repository, &again));
    Ok(())
}

#[test]
fn test_missing_dependency_lenient_and_strict() -> anyhow::Result<()> {
    init_logging();
    let lenient = RegistryBuilder::new()
        .add_error_service(Arc::new(LoggingErrorService))
        .add_descriptor(repository_descriptor())
        .build()?;
    assert!(lenient.get_service(&Lookup::contract("Repository"))?.is_none());

    let strict = RegistryBuilder::new()
        .strict_mode(true)
        .add_descriptor(repository_descriptor())
        .build()?;
    assert!(strict.get_service(&Lookup::contract("Repository")).is_err());

    let nothing = strict.get_service(&Lookup::contract("Unknown")).unwrap_err();
    assert!(matches!(nothing, DependencyError::UnsatisfiedDependency { .. }));
    Ok(())
}

#[test]
fn test_strict_mode_from_config_file() -> anyhow::Result<()> {
    init_logging();
    let dir = tempfile::tempdir()?;
    let mut file = std::fs::File::create(dir.path().join("registry.toml"))?;
    writeln!(file, "name = \"orders\"")?;
    writeln!(file, "strict_mode = true")?;
    writeln!(file, "[immediate]")?;
    writeln!(file, "decay_timeout_ms = 500")?;

    let locator = RegistryBuilder::new()
        .with_config_file(dir.path().join("registry").to_string_lossy())
        .build()?;

    assert_eq!(locator.name(), "orders");
    assert!(locator.config().strict_mode);
    assert_eq!(locator.config().decay_timeout(), Duration::from_millis(500));
    assert!(locator.get_service(&Lookup::contract("Missing")).is_err());
    Ok(())
}

#[test]
fn test_invalid_config_file_fails_build() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let mut file = std::fs::File::create(dir.path().join("registry.toml"))?;
    writeln!(file, "[immediate]")?;
    writeln!(file, "decay_timeout_ms = 0")?;

    let result = RegistryBuilder::new()
        .with_config_file(dir.path().join("registry").to_string_lossy())
        .build();
    assert!(matches!(result, Err(InfrastructureError::ConfigError { .. })));
    Ok(())
}

#[test]
fn test_rank_change_reorders_resolution() -> anyhow::Result<()> {
    init_logging();
    let locator = RegistryBuilder::new().build()?;
    let added = locator.add_descriptors(vec![
        Descriptor::new("MemoryStore").to("Store").with_rank(1),
        Descriptor::new("DiskStore").to("Store").with_rank(5),
    ])?;

    let lookup = Lookup::contract("Store");
    let best = locator.get_best_descriptor(&lookup)?.expect("存在 Store");
    assert_eq!(best.implementation(), "DiskStore");

    let old = added[0].set_rank(10);
    assert_eq!(old, 1);

    let best = locator.get_best_descriptor(&lookup)?.expect("存在 Store");
    assert_eq!(best.implementation(), "MemoryStore");
    let order: Vec<_> = locator
        .get_all_descriptors(&lookup)?
        .iter()
        .map(|d| d.implementation().to_string())
        .collect();
    assert_eq!(order, vec!["MemoryStore", "DiskStore"]);
    Ok(())
}

#[test]
fn test_custom_scope_caches_and_destroys_on_shutdown() -> anyhow::Result<()> {
    init_logging();
    let destroyed = Arc::new(AtomicUsize::new(0));
    let counter = destroyed.clone();
    let creator = FnCreator::new(|_| Ok(Arc::new(7_u32) as Instance))
        .on_destroy(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .into_creator();

    let scope = Arc::new(RequestScope::new());
    let locator = RegistryBuilder::new()
        .add_scope_context(scope.clone())
        .add_descriptor(
            Descriptor::new("Session")
                .in_scope(ScopeKind::Custom("request".to_string()))
                .with_creator(creator),
        )
        .build()?;

    let first = locator.require_service::<u32>(&Lookup::contract("Session"))?;
    let second = locator.require_service::<u32>(&Lookup::contract("Session"))?;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(scope.len(), 1);

    locator.shutdown();
    assert!(locator.is_shutdown());
    assert_eq!(destroyed.load(Ordering::SeqCst), 1);
    assert!(scope.is_empty());
    assert!(locator.get_best_descriptor(&Lookup::contract("Session"))?.is_none());
    Ok(())
}

#[test]
fn test_unknown_custom_scope_is_reported() -> anyhow::Result<()> {
    let locator = RegistryBuilder::new()
        .strict_mode(true)
        .add_descriptor(Descriptor::new("Orphan").in_scope(ScopeKind::Custom("tenant".to_string())))
        .build()?;

    let error = locator.get_service(&Lookup::contract("Orphan")).unwrap_err();
    assert!(matches!(error, DependencyError::ScopeNotFound { .. }));
    Ok(())
}

#[test]
fn test_listeners_see_commits_in_order() -> anyhow::Result<()> {
    init_logging();
    let listener = Arc::new(SequenceListener::default());
    let locator = RegistryBuilder::new()
        .add_configuration_listener(listener.clone())
        .build()?;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let locator = locator.clone();
            thread::spawn(move || {
                let mut configuration = locator.create_dynamic_configuration();
                configuration.bind(Descriptor::new(format!("Worker{}", i)).to("Worker"));
                configuration.commit().map(|changes| changes.sequence)
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("提交线程异常退出")?;
    }

    assert_eq!(*listener.sequences.lock(), (1..=8).collect::<Vec<u64>>());
    assert_eq!(locator.get_all_descriptors(&Lookup::contract("Worker"))?.len(), 8);
    Ok(())
}

#[tokio::test]
async fn test_watch_receives_change_sets() -> anyhow::Result<()> {
    init_logging();
    let locator = RegistryBuilder::new().build()?;
    let mut changes = locator.watch();

    let mut configuration = locator.create_dynamic_configuration();
    configuration.bind(Descriptor::new("Cache"));
    configuration.bind(Descriptor::new("Mailer"));
    configuration.commit()?;

    let first = changes.recv().await?;
    assert_eq!(first.sequence, 1);
    assert_eq!(first.added.len(), 2);

    let cache = locator
        .get_best_descriptor(&Lookup::contract("Cache"))?
        .expect("存在 Cache");
    let mut configuration = locator.create_dynamic_configuration();
    configuration.unbind(cache.id());
    configuration.commit()?;

    let second = changes.recv().await?;
    assert_eq!(second.sequence, 2);
    assert!(second.added.is_empty());
    assert_eq!(second.removed[0].id(), cache.id());
    Ok(())
}

#[tokio::test]
async fn test_wait_for_descriptor_bound_later() -> anyhow::Result<()> {
    init_logging();
    let locator = RegistryBuilder::new().build()?;

    let binder = locator.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        binder.add_descriptors(vec![Descriptor::new("Scheduler").qualified_by("primary")])
    });

    let lookup = Lookup::contract("Scheduler").with_qualifier("primary");
    let found = locator.wait_for_descriptor(&lookup, WAIT).await?;
    assert_eq!(found.map(|d| d.implementation().to_string()), Some("Scheduler".to_string()));
    handle.join().expect("绑定线程异常退出")?;

    let absent = locator
        .wait_for_descriptor(&Lookup::contract("Never"), Duration::from_millis(50))
        .await?;
    assert!(absent.is_none());
    Ok(())
}
