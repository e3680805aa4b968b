//! The run loop (spec §4.8): mode-specific scheduling (onetime / interval /
//! watch), SIGHUP-triggered resource reload, SIGTERM/SIGINT shutdown, and
//! the failure-mode policy (fail-fast / best-effort). Grounded on the
//! teacher's `cmd::run_pipeline` (a `tokio::time::interval` tick source for
//! periodic runs, `tokio::signal::ctrl_c()` for shutdown), generalized to
//! confd's three scheduling modes plus the SIGHUP reload
//! `tokio::signal::ctrl_c()` never needed to handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::Backend;
use crate::cli::{Cli, FailureMode, RunMode};
use crate::config::{resource::scan_resources, GlobalConfig, TemplateResource};
use crate::errors::{ConfrError, FailureKind, Result};
use crate::health::HealthState;
use crate::processor::{self, ResourceOutcome};
use crate::template::Renderer;

type BackendMap = HashMap<String, Arc<dyn Backend>>;

/// Everything a running cycle needs, behind the single indirection spec §9
/// ("SIGHUP vs. config reload") calls for: SIGHUP swaps `resources` (and,
/// since per-resource backend overrides may have changed, `backends`)
/// atomically; in-flight work keeps using what it already captured.
struct Shared {
    global: GlobalConfig,
    resources: RwLock<Vec<TemplateResource>>,
    backends: RwLock<BackendMap>,
    renderer: Renderer,
    health: HealthState,
}

/// The outcome of one full pass over every resource (spec §4.8,
/// "Failure-mode policy").
#[derive(Default)]
struct CycleReport {
    updated: usize,
    unchanged: usize,
    failed: Vec<(String, FailureKind, ConfrError)>,
}

impl CycleReport {
    fn record(&mut self, name: &str, outcome: ResourceOutcome) {
        match outcome {
            ResourceOutcome::Unchanged => self.unchanged += 1,
            ResourceOutcome::Updated => self.updated += 1,
            ResourceOutcome::Failed { kind, cause } => self.failed.push((name.to_string(), kind, cause)),
        }
    }

    fn is_failure(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Logs an aggregated report of every failed resource (spec §7,
    /// "Best-effort runs end with an aggregated report listing every
    /// failed resource").
    fn log_summary(&self) {
        info!(updated = self.updated, unchanged = self.unchanged, failed = self.failed.len(), "cycle complete");
        for (name, kind, cause) in &self.failed {
            error!(resource = %name, kind = %kind, error = %cause, "resource failed");
        }
    }
}

/// Entry point invoked from `main` (spec §4.1, §4.8).
pub async fn run(cli: Cli) -> Result<()> {
    let global = GlobalConfig::from_cli(&cli);

    if matches!(global.mode, RunMode::Watch) && !global.backend_supports_watch {
        return Err(ConfrError::ConfigError(
            "watch mode requested but the selected backend does not support WatchPrefix".to_string(),
        ));
    }

    let resources = scan_resources(&global.confdir)?;
    let backends = processor::build_backends(&resources, &global).await?;
    let health = HealthState::new();
    health.set_templates_loaded(resources.len());

    let renderer = Renderer::new(global.templates_dir.clone()).with_health(health.clone());
    let shared = Arc::new(Shared {
        renderer,
        resources: RwLock::new(resources),
        backends: RwLock::new(backends),
        global,
        health,
    });

    let ctx = CancellationToken::new();

    if let Some(addr) = shared.global.metrics_addr.clone() {
        let health = shared.health.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = crate::health::serve(&addr, health, ctx).await {
                error!(error = %err, "metrics/health endpoint exited");
            }
        });
    }

    spawn_sighup_handler(shared.clone(), ctx.clone());
    spawn_shutdown_handler(ctx.clone());

    probe_backend_health(&shared).await;
    shared.health.mark_started();

    let result = match shared.global.mode {
        RunMode::Onetime => run_onetime(&shared, &ctx).await,
        RunMode::Interval(period) => run_interval(shared.clone(), period, ctx.clone()).await,
        RunMode::Watch => run_watch(shared.clone(), ctx.clone()).await,
    };

    ctx.cancel();
    result
}

async fn probe_backend_health(shared: &Shared) {
    let backends = shared.backends.read().await;
    let Some(backend) = backends.get(shared.global.default_backend.name()) else {
        return;
    };
    let start = Instant::now();
    let probe_ctx = CancellationToken::new();
    let result = backend.health_check(&probe_ctx).await;
    let elapsed = start.elapsed();
    match result {
        Ok(()) => shared.health.record_health_check(true, "ok", elapsed),
        Err(err) => shared.health.record_health_check(false, err.to_string(), elapsed),
    }
}

async fn run_cycle(shared: &Shared, ctx: &CancellationToken) -> CycleReport {
    let resources = shared.resources.read().await;
    let backends = shared.backends.read().await;
    let mut report = CycleReport::default();

    for resource in resources.iter() {
        let backend_name = shared.global.effective_backend(resource).name();
        let Some(backend) = backends.get(backend_name) else {
            report.record(
                &resource.name,
                ResourceOutcome::Failed {
                    kind: FailureKind::Config,
                    cause: ConfrError::BackendNotFound(backend_name.to_string()),
                },
            );
            if shared.global.failure_mode == FailureMode::FailFast {
                break;
            }
            continue;
        };

        let outcome = processor::process_resource(resource, &shared.global, backend.as_ref(), &shared.renderer, ctx).await;
        let is_failure = matches!(outcome, ResourceOutcome::Failed { .. });
        report.record(&resource.name, outcome);
        if is_failure && shared.global.failure_mode == FailureMode::FailFast {
            break;
        }
    }

    report
}

async fn run_onetime(shared: &Arc<Shared>, ctx: &CancellationToken) -> Result<()> {
    let report = run_cycle(shared, ctx).await;
    report.log_summary();
    if report.is_failure() {
        return Err(ConfrError::ConfigError("one or more resources failed".to_string()));
    }
    Ok(())
}

async fn run_interval(shared: Arc<Shared>, period: Duration, ctx: CancellationToken) -> Result<()> {
    // A real timer rather than a cron expression: spec §6 puts no upper
    // bound on interval seconds, and a cron seconds-field step can't express
    // a period that doesn't divide (or exceeds) 60. `tick()` fires
    // immediately on the first call, so the first cycle runs without
    // waiting out a full period, and delayed ticks are not bunched up.
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.cancelled() => return Ok(()),
            _ = ticker.tick() => {
                let report = run_cycle(&shared, &ctx).await;
                report.log_summary();
                if report.is_failure() && shared.global.failure_mode == FailureMode::FailFast {
                    return Err(ConfrError::ConfigError("one or more resources failed".to_string()));
                }
            }
        }
    }
}

async fn run_watch(shared: Arc<Shared>, ctx: CancellationToken) -> Result<()> {
    let resources = shared.resources.read().await.clone();
    let mut tasks = tokio::task::JoinSet::new();

    for resource in resources {
        let shared = shared.clone();
        let ctx = ctx.clone();
        tasks.spawn(async move { watch_resource(shared, resource, ctx).await });
    }

    while tasks.join_next().await.is_some() {}
    Ok(())
}

/// One resource's watch loop (spec §4.8, "Watch"): initial `WatchPrefix`
/// establishes a starting index, then process/wait alternate until the
/// root context is cancelled.
async fn watch_resource(shared: Arc<Shared>, resource: TemplateResource, ctx: CancellationToken) {
    let backend_name = shared.global.effective_backend(&resource).name().to_string();
    let Some(backend) = shared.backends.read().await.get(&backend_name).cloned() else {
        error!(resource = %resource.name, backend = %backend_name, "no backend client for resource, cannot watch");
        return;
    };

    let stop = tokio::sync::Notify::new();
    let keys = resource.effective_keys();
    // Watches are keyed by one representative prefix per resource; the full
    // key set is still passed through so a future multi-prefix-per-resource
    // backend can fan further watches out from it.
    let watch_key = resource
        .prefix
        .clone()
        .or_else(|| keys.first().cloned())
        .unwrap_or_else(|| "/".to_string());

    let mut wait_index = match backend.watch_prefix(&ctx, &watch_key, &keys, 0, &stop).await {
        Ok(idx) => idx,
        Err(err) => {
            error!(resource = %resource.name, error = %err, "initial watch setup failed");
            return;
        }
    };

    loop {
        if ctx.is_cancelled() {
            return;
        }

        let outcome = processor::process_resource(&resource, &shared.global, backend.as_ref(), &shared.renderer, &ctx).await;
        if let ResourceOutcome::Failed { kind, cause } = &outcome {
            warn!(resource = %resource.name, kind = %kind, error = %cause, "watch-triggered render failed");
            if shared.global.failure_mode == FailureMode::FailFast {
                ctx.cancel();
                return;
            }
        }

        match backend.watch_prefix(&ctx, &watch_key, &keys, wait_index, &stop).await {
            Ok(new_index) => wait_index = new_index,
            Err(err) => {
                if ctx.is_cancelled() {
                    return;
                }
                warn!(resource = %resource.name, error = %err, "watch_prefix failed, retrying");
            }
        }
    }
}

/// Re-scans `confdir`/`templates/` on SIGHUP, clearing the template cache
/// and atomically swapping in the new resource list and backend map (spec
/// §4.8 "SIGHUP", §9 "SIGHUP vs. config reload"). In-flight work keeps
/// using the list it already captured; the new list takes effect on the
/// next cycle (interval) or future watch re-entries (spec §9, open
/// question 2: the current implementation lets an in-flight `WaitNext`
/// complete naturally rather than cancelling it).
fn spawn_sighup_handler(shared: Arc<Shared>, ctx: CancellationToken) {
    tokio::spawn(async move {
        let Ok(mut hangup) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) else {
            warn!("failed to install SIGHUP handler");
            return;
        };
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                signal = hangup.recv() => {
                    if signal.is_none() {
                        return;
                    }
                    info!("SIGHUP received, reloading configuration");
                    match scan_resources(&shared.global.confdir) {
                        Ok(new_resources) => {
                            match processor::build_backends(&new_resources, &shared.global).await {
                                Ok(new_backends) => {
                                    shared.health.set_templates_loaded(new_resources.len());
                                    *shared.resources.write().await = new_resources;
                                    *shared.backends.write().await = new_backends;
                                    shared.renderer.clear_cache();
                                    info!("configuration reloaded");
                                }
                                Err(err) => error!(error = %err, "SIGHUP reload failed while building backends, keeping old configuration"),
                            }
                        }
                        Err(err) => error!(error = %err, "SIGHUP reload failed while scanning resources, keeping old configuration"),
                    }
                }
            }
        }
    });
}

/// Cancels the root context on SIGTERM/SIGINT (spec §4.8, "SIGTERM /
/// SIGINT"): every watcher unblocks via its `stop`/`ctx.Done()` and
/// outstanding renders complete or are abandoned.
fn spawn_shutdown_handler(ctx: CancellationToken) {
    tokio::spawn(async move {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => info!("SIGTERM received, shutting down"),
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    info!("SIGINT received, shutting down");
                }
            }
        }
        ctx.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::MockBackend;
    use crate::backend::KeyStore;
    use crate::cli::FailureMode;
    use crate::config::backend::BackendConfig;
    use crate::config::resource::FileMode;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn test_resource(dir: &TempDir, name: &str) -> TemplateResource {
        TemplateResource {
            name: name.to_string(),
            src: PathBuf::from(format!("{name}.tmpl")),
            dest: dir.path().join(format!("{name}.conf")),
            keys: vec!["/app".into()],
            mode: FileMode::default(),
            uid: None,
            gid: None,
            prefix: None,
            check_cmd: None,
            reload_cmd: None,
            check_cmd_timeout: None,
            reload_cmd_timeout: None,
            backend_override: None,
        }
    }

    fn test_shared(dir: &TempDir, resources: Vec<TemplateResource>, failure_mode: FailureMode) -> Arc<Shared> {
        let mut backends: BackendMap = HashMap::new();
        let mut store = KeyStore::new();
        store.insert("/app/name", "svc");
        backends.insert("env".to_string(), Arc::new(MockBackend::new(store)));

        Arc::new(Shared {
            global: GlobalConfig {
                confdir: dir.path().to_path_buf(),
                templates_dir: dir.path().to_path_buf(),
                mode: RunMode::Onetime,
                failure_mode,
                check_cmd_timeout: Duration::from_secs(3),
                reload_cmd_timeout: Duration::from_secs(3),
                default_backend: BackendConfig::Env,
                backend_supports_watch: false,
                metrics_addr: None,
            },
            resources: RwLock::new(resources),
            backends: RwLock::new(backends),
            renderer: Renderer::new(dir.path().to_path_buf()),
            health: HealthState::new(),
        })
    }

    #[tokio::test]
    async fn test_run_cycle_best_effort_processes_all_resources() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.tmpl"), "{{ getv(\"/app/name\") }}").unwrap();
        std::fs::write(dir.path().join("b.tmpl"), "{{ getv(\"/missing\") }}").unwrap();

        let resources = vec![test_resource(&dir, "a"), test_resource(&dir, "b")];
        let shared = test_shared(&dir, resources, FailureMode::BestEffort);
        let ctx = CancellationToken::new();

        let report = run_cycle(&shared, &ctx).await;
        assert_eq!(report.updated, 1);
        assert_eq!(report.failed.len(), 1);
    }

    #[tokio::test]
    async fn test_run_cycle_fail_fast_stops_after_first_failure() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.tmpl"), "{{ getv(\"/missing\") }}").unwrap();
        std::fs::write(dir.path().join("b.tmpl"), "{{ getv(\"/app/name\") }}").unwrap();

        let resources = vec![test_resource(&dir, "a"), test_resource(&dir, "b")];
        let shared = test_shared(&dir, resources, FailureMode::FailFast);
        let ctx = CancellationToken::new();

        let report = run_cycle(&shared, &ctx).await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.updated, 0);
        assert!(!dir.path().join("b.conf").exists());
    }

    #[tokio::test]
    async fn test_run_onetime_returns_err_on_any_failure() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.tmpl"), "{{ getv(\"/missing\") }}").unwrap();

        let resources = vec![test_resource(&dir, "a")];
        let shared = test_shared(&dir, resources, FailureMode::BestEffort);
        let ctx = CancellationToken::new();

        assert!(run_onetime(&shared, &ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_run_onetime_succeeds_when_all_unchanged_or_updated() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.tmpl"), "{{ getv(\"/app/name\") }}").unwrap();

        let resources = vec![test_resource(&dir, "a")];
        let shared = test_shared(&dir, resources, FailureMode::BestEffort);
        let ctx = CancellationToken::new();

        assert!(run_onetime(&shared, &ctx).await.is_ok());
    }
}
