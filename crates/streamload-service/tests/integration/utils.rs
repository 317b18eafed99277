use std::path::Path;
use std::sync::Arc;

use streamload_service::admission::AdmissionController;
use streamload_service::caching::{DiskCache, StreamableCache};
use streamload_service::config::LoadingConfig;
use streamload_service::loader::Loader;
use streamload_service::loading::Orchestrator;

pub use streamload_test::{Response, Server, TempDir, TestLoader, drive, tick_until};

/// Setup tests and create an orchestrator around `loader`.
///
/// The orchestrator gets its own cache and admission budget, and spawns its flows on the
/// current runtime. The `update_config` closure can modify the default configuration.
pub fn setup_orchestrator<L: Loader>(
    loader: L,
    update_config: impl FnOnce(&mut LoadingConfig),
) -> Orchestrator<L> {
    let mut config = LoadingConfig::default();
    update_config(&mut config);

    orchestrator_with_cache(loader, StreamableCache::new(L::NAME), &config)
}

/// Like [`setup_orchestrator`], with the cache backed by a disk cache in `root`.
pub fn setup_disk_cached_orchestrator<L: Loader>(loader: L, root: &Path) -> Orchestrator<L> {
    let disk = DiskCache::new(L::NAME, root).unwrap();
    let cache = StreamableCache::new(L::NAME).with_disk_cache(disk);

    orchestrator_with_cache(loader, cache, &LoadingConfig::default())
}

fn orchestrator_with_cache<L: Loader>(
    loader: L,
    cache: StreamableCache<L::Asset>,
    config: &LoadingConfig,
) -> Orchestrator<L> {
    streamload_test::setup();

    let admission = Arc::new(AdmissionController::from_config(config));
    Orchestrator::new(
        loader,
        Arc::new(cache),
        admission,
        config,
        tokio::runtime::Handle::current(),
    )
}
