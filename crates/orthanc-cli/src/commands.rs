use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};

use orthanc_config::load_config;
use orthanc_dimse::{accept_loop, IndexBackedFindHandler, IndexBackedStoreHandler, ReusableAssociation, ScpHandlers};
use orthanc_jobs::{JobsEngine, JobsRegistry};
use orthanc_store::{DbWrapper, FilesystemStorageArea, ResourceIndex};

use crate::output::render_statistics;

/// Load `config`, bring up the database, storage area, resource index, jobs
/// engine and DIMSE accept loop, then block until Ctrl+C joins every
/// background thread in turn.
pub fn serve(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    std::fs::create_dir_all(&config.storage_directory)
        .with_context(|| format!("creating storage directory {}", config.storage_directory))?;

    let db_path = format!("{}/index.sqlite", config.storage_directory);
    let db = Arc::new(DbWrapper::open(&db_path).with_context(|| format!("opening database {db_path}"))?);
    let storage: Arc<dyn orthanc_store::StorageArea> =
        Arc::new(FilesystemStorageArea::new(config.storage_directory.as_str()));

    let index = ResourceIndex::new(db, storage, config.maximum_storage_size, config.stable_age);

    let jobs_registry = JobsRegistry::new(config.jobs_history_size);
    let jobs_engine = JobsEngine::new(jobs_registry, config.worker_wakeup_interval, config.retry_sweep_interval);
    jobs_engine.start(config.workers);

    let association = ReusableAssociation::new(config.dicom_association_close_delay);

    let handlers = Arc::new(ScpHandlers {
        store: Arc::new(IndexBackedStoreHandler::new(Arc::clone(&index))),
        find: Arc::new(IndexBackedFindHandler::new(Arc::clone(&index), config.limit_find_results)),
        worklist: None,
        move_handler: None,
        get_handler_factory: None,
    });

    let listener = TcpListener::bind(("0.0.0.0", config.dicom_port))
        .with_context(|| format!("binding DICOM port {}", config.dicom_port))?;

    tracing::info!(
        aet = %config.dicom_aet,
        port = config.dicom_port,
        workers = config.workers,
        "orthanc-server starting"
    );
    tracing::info!("{}", render_statistics(&index.get_statistics()?));

    let aet = config.dicom_aet.clone();
    let _accept_handle = {
        let handlers = Arc::clone(&handlers);
        std::thread::Builder::new()
            .name("orthanc-dimse-accept".to_string())
            .spawn(move || accept_loop(listener, aet, handlers))
            .context("failed to spawn DIMSE accept thread")?
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.store(true, Ordering::SeqCst))
            .context("failed to install Ctrl+C handler")?;
    }
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    tracing::info!("shutdown signal received, stopping");
    jobs_engine.stop();
    index.shutdown();
    association.shutdown();

    tracing::info!("{}", render_statistics(&index.get_statistics()?));
    Ok(())
}
