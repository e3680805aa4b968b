//! The resource processor (spec §4.7): for one resource, resolves its
//! effective backend, fetches and filters its keys, renders, and stages
//! the result. Grounded on the teacher's `cmd::execute_pipeline_job`
//! (resolve config -> build client -> fetch -> transform -> write, wrapped
//! in one `#[instrument]`ed function returning a typed result),
//! generalized from fetch/transform/write to fetch/filter/render/stage.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::backend::Backend;
use crate::config::{GlobalConfig, TemplateResource};
use crate::errors::{ConfrError, FailureKind, Result};
use crate::stager::{self, StageOutcome};
use crate::template::Renderer;

/// The typed result of processing one resource (spec §4.7 step 6).
#[derive(Debug)]
pub enum ResourceOutcome {
    Unchanged,
    Updated,
    Failed { kind: FailureKind, cause: ConfrError },
}

/// Fetches, renders, and stages one resource against an already-built
/// backend client (spec §4.7 steps 1-5). The caller resolves and owns the
/// backend; this function does not itself decide which backend to use
/// beyond using whichever is passed in, so callers can share one backend
/// client across every resource bound to it (spec §5, "Shared resources").
#[instrument(name = "resource", skip_all, fields(resource = %resource.name))]
pub async fn process_resource(
    resource: &TemplateResource,
    global: &GlobalConfig,
    backend: &dyn Backend,
    renderer: &Renderer,
    ctx: &CancellationToken,
) -> ResourceOutcome {
    match process_resource_inner(resource, global, backend, renderer, ctx).await {
        Ok(outcome) => outcome,
        Err((kind, cause)) => {
            warn!(resource = %resource.name, kind = %kind, error = %cause, "resource processing failed");
            ResourceOutcome::Failed { kind, cause }
        }
    }
}

async fn process_resource_inner(
    resource: &TemplateResource,
    global: &GlobalConfig,
    backend: &dyn Backend,
    renderer: &Renderer,
    ctx: &CancellationToken,
) -> std::result::Result<ResourceOutcome, (FailureKind, ConfrError)> {
    // Step 2: normalize the key list for prefix matching (spec §4.7 step 2).
    let keys = resource.effective_keys();

    // Step 3: fetch (spec §4.7 step 3).
    let mut store = backend
        .get_values(ctx, &keys)
        .await
        .map_err(|e| (FailureKind::Fetch, e))?;

    // Step 4: mandatory post-filter, even for backends that already filter
    // (spec §4.7 step 4 -- etcd range scans may return adjacent keys).
    store.retain_prefixes(&keys);

    // If the resource declares a `prefix`, the filtered keys are still
    // prefix-qualified; strip it so template lookups use the undecorated
    // key the resource author wrote (spec §3, "prefix ... stripped before
    // template lookup").
    let store = strip_resource_prefix(store, resource);

    // Step 5a: render (spec §4.5). A render error aborts the resource: no
    // staged file is produced.
    let output = renderer
        .render(resource, store)
        .map_err(|e| (FailureKind::Render, e))?;

    // Step 5b: stage (spec §4.6).
    let check_timeout = global.effective_check_timeout(resource);
    let reload_timeout = global.effective_reload_timeout(resource);
    let outcome = stager::stage(resource, &output, check_timeout, reload_timeout)
        .await
        .map_err(|e| (classify_stage_error(&e), e))?;

    match outcome {
        StageOutcome::Unchanged => {
            info!(resource = %resource.name, "unchanged");
            Ok(ResourceOutcome::Unchanged)
        }
        StageOutcome::Updated { reload_failed: None } => {
            info!(resource = %resource.name, dest = %resource.dest.display(), "updated");
            Ok(ResourceOutcome::Updated)
        }
        StageOutcome::Updated { reload_failed: Some(err) } => {
            // spec §7: reload failure is reported but dest is not rolled
            // back, and is not itself a reason to treat the cycle as having
            // failed to produce a dest -- but it IS a per-resource failure
            // for failure-mode accounting purposes.
            Err((FailureKind::Reload, err))
        }
    }
}

fn strip_resource_prefix(store: crate::backend::KeyStore, resource: &TemplateResource) -> crate::backend::KeyStore {
    let Some(prefix) = &resource.prefix else {
        return store;
    };
    let trimmed_prefix = prefix.trim_end_matches('/');
    let mut stripped = crate::backend::KeyStore::new();
    for (key, value) in store.iter() {
        let unprefixed = key.strip_prefix(trimmed_prefix).unwrap_or(key);
        stripped.insert(unprefixed.to_string(), value.clone());
    }
    stripped
}

fn classify_stage_error(err: &ConfrError) -> FailureKind {
    match err {
        ConfrError::CheckError { .. } => FailureKind::Check,
        ConfrError::ReloadError { .. } => FailureKind::Reload,
        _ => FailureKind::Rename,
    }
}

/// Builds every distinct backend client a resource list needs, keyed by
/// backend name (spec §5, "Backend clients are shared by all resources
/// bound to them and must be safe under concurrent calls").
pub async fn build_backends(
    resources: &[TemplateResource],
    global: &GlobalConfig,
) -> Result<std::collections::HashMap<String, Arc<dyn Backend>>> {
    let mut backends: std::collections::HashMap<String, Arc<dyn Backend>> = std::collections::HashMap::new();
    backends.insert(
        global.default_backend.name().to_string(),
        Arc::from(crate::backend::build(&global.default_backend).await?),
    );
    for resource in resources {
        let cfg = global.effective_backend(resource);
        let key = cfg.name().to_string();
        if !backends.contains_key(&key) {
            backends.insert(key, Arc::from(crate::backend::build(cfg).await?));
        }
    }
    Ok(backends)
}
