//! Wiring of the cache, store, loops and notification pool into one service.

use crate::cache::TermCache;
use crate::checker::{CheckerSettings, WatchChecker};
use crate::config::AppConfig;
use crate::db::WatchStore;
use crate::notify::{HandlebarsRenderer, Mailer, NotificationDispatcher, Renderer};
use crate::source::TimetableSource;
use crate::updater::CacheUpdater;
use crate::watch::WatchService;
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// External collaborators the service depends on.
pub struct Collaborators {
    pub source: Arc<dyn TimetableSource>,
    pub mailer: Arc<dyn Mailer>,
    /// Defaults to [`HandlebarsRenderer`] with the configured or built-in template
    pub renderer: Option<Arc<dyn Renderer>>,
}

impl Collaborators {
    pub fn new(source: Arc<dyn TimetableSource>, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            source,
            mailer,
            renderer: None,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Snapshot returned by [`SeatWatch::health`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub database: bool,
    pub terms_loaded: usize,
    pub courses_loaded: usize,
    pub update_loop_running: bool,
    pub check_loop_running: bool,
    pub dispatcher_running: bool,
    pub notifications_in_flight: usize,
    pub empty_cycles: u32,
}

struct LoopHandles {
    update: JoinHandle<()>,
    check: JoinHandle<()>,
}

/// The running watcher: background loops plus the add-watch entry point.
pub struct SeatWatch {
    config: AppConfig,
    cache: Arc<TermCache>,
    store: Arc<WatchStore>,
    watch: WatchService,
    updater: Arc<CacheUpdater>,
    checker: Arc<WatchChecker>,
    dispatcher: Arc<NotificationDispatcher>,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Option<LoopHandles>>,
}

impl SeatWatch {
    /// Opens the configured database and builds the service.
    pub fn open(config: AppConfig, collaborators: Collaborators) -> Result<Self> {
        let store = WatchStore::open(&config.database.path)
            .with_context(|| format!("Failed to open database at {}", config.database.path.display()))?;
        Self::new(config, Arc::new(store), collaborators)
    }

    /// Builds the service around an existing store.
    ///
    /// Must be called from within a tokio runtime; the notification workers
    /// start immediately, the loops only on [`SeatWatch::start`].
    pub fn new(config: AppConfig, store: Arc<WatchStore>, collaborators: Collaborators) -> Result<Self> {
        let renderer: Arc<dyn Renderer> = match collaborators.renderer {
            Some(renderer) => renderer,
            None => match &config.notifications.template_path {
                Some(path) => Arc::new(
                    HandlebarsRenderer::with_template(path)
                        .with_context(|| format!("Failed to load template {}", path.display()))?,
                ),
                None => Arc::new(HandlebarsRenderer::new().context("Failed to load built-in template")?),
            },
        };

        let cache = Arc::new(TermCache::new());
        let source = collaborators.source;
        let dispatcher = Arc::new(NotificationDispatcher::start(
            Arc::clone(&store),
            collaborators.mailer,
            config.notifications.workers,
            config.notifications.queue_capacity,
        ));
        let updater = Arc::new(CacheUpdater::new(
            Arc::clone(&source),
            Arc::clone(&cache),
            config.confirm_delay(),
        ));
        let checker = Arc::new(WatchChecker::new(
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&source),
            Arc::clone(&dispatcher),
            renderer,
            CheckerSettings {
                fetch_timeout: config.fetch_timeout(),
                empty_cycle_threshold: config.checker.empty_cycle_threshold,
                timetable_url: config.notifications.timetable_url.clone(),
            },
        ));
        let watch_service = WatchService::new(
            Arc::clone(&cache),
            source,
            Arc::clone(&store),
            config.live_fetch_timeout(),
        );
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            cache,
            store,
            watch: watch_service,
            updater,
            checker,
            dispatcher,
            shutdown_tx,
            loops: Mutex::new(None),
        })
    }

    /// Spawns the update and check loops. Calling it again is a no-op.
    pub fn start(&self) {
        let mut loops = self.loops.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if loops.is_some() {
            warn!("Background loops already started");
            return;
        }

        let update = tokio::spawn(
            Arc::clone(&self.updater).run(self.config.update_interval(), self.shutdown_tx.subscribe()),
        );
        let check = tokio::spawn(Arc::clone(&self.checker).run(
            self.config.check_interval(),
            self.config.initial_check_delay(),
            self.shutdown_tx.subscribe(),
        ));
        *loops = Some(LoopHandles { update, check });

        info!(
            update_secs = self.config.intervals.update_secs,
            check_secs = self.config.intervals.check_secs,
            "Seat watcher started"
        );
    }

    pub fn health(&self) -> HealthReport {
        let database = self.store.check_health();
        let stats = self.cache.stats();
        let (update_loop_running, check_loop_running) = self
            .loops
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|l| (!l.update.is_finished(), !l.check.is_finished()))
            .unwrap_or((false, false));
        let dispatcher_running = self.dispatcher.is_running();

        let status = if !database {
            HealthStatus::Unhealthy
        } else if stats.term_count == 0 || !update_loop_running || !check_loop_running || !dispatcher_running {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            status,
            database,
            terms_loaded: stats.term_count,
            courses_loaded: stats.total_courses,
            update_loop_running,
            check_loop_running,
            dispatcher_running,
            notifications_in_flight: self.dispatcher.in_flight_count(),
            empty_cycles: self.checker.empty_cycles(),
        }
    }

    /// Signals the loops to stop, waits for them and drains the notification queue.
    pub async fn shutdown(&self) {
        info!("Shutting down seat watcher");
        self.shutdown_tx.send_replace(true);

        let loops = self
            .loops
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(loops) = loops {
            for (name, handle) in [("update", loops.update), ("check", loops.check)] {
                if let Err(e) = handle.await {
                    error!(loop_name = name, error = %e, "Background loop ended abnormally");
                }
            }
        }

        self.dispatcher.shutdown().await;
        info!("Seat watcher stopped");
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TermCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<WatchStore> {
        &self.store
    }

    pub fn watch_service(&self) -> &WatchService {
        &self.watch
    }

    pub fn updater(&self) -> &Arc<CacheUpdater> {
        &self.updater
    }

    pub fn checker(&self) -> &Arc<WatchChecker> {
        &self.checker
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.dispatcher
    }
}
