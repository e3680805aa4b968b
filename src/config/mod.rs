//! Configuration surface: assembling a [`GlobalConfig`] from the parsed CLI
//! (spec §4.1 treats this whole seam as an external collaborator; confr
//! still needs a concrete implementation of it to be a runnable binary).

pub mod backend;
pub mod resource;

use std::path::PathBuf;
use std::time::Duration;

use crate::cli::{Cli, FailureMode, RunMode};
use crate::config::backend::BackendConfig;

pub use resource::TemplateResource;

/// Everything the run loop needs that isn't a per-resource detail.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub confdir: PathBuf,
    pub templates_dir: PathBuf,
    pub mode: RunMode,
    pub failure_mode: FailureMode,
    pub check_cmd_timeout: Duration,
    pub reload_cmd_timeout: Duration,
    pub default_backend: BackendConfig,
    pub backend_supports_watch: bool,
    pub metrics_addr: Option<String>,
}

impl GlobalConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        GlobalConfig {
            confdir: cli.confdir.clone(),
            templates_dir: cli.confdir.join("templates"),
            mode: cli.mode(),
            failure_mode: cli.failure_mode,
            check_cmd_timeout: cli.check_cmd_timeout,
            reload_cmd_timeout: cli.reload_cmd_timeout,
            default_backend: cli.backend.to_config(),
            backend_supports_watch: cli.backend.supports_watch(),
            metrics_addr: cli.metrics_addr.clone(),
        }
    }

    /// Resolves a resource's effective backend: its own override, or the
    /// global default (spec §3, "Optional per-resource `backend` block").
    pub fn effective_backend<'a>(&'a self, resource: &'a TemplateResource) -> &'a BackendConfig {
        resource
            .backend_override
            .as_ref()
            .unwrap_or(&self.default_backend)
    }

    /// Resolves the effective command timeout: per-resource override, then
    /// global default, then "no timeout" if both are zero (spec §3, §9
    /// "Global timeouts" — centralised in one helper).
    pub fn effective_check_timeout(&self, resource: &TemplateResource) -> Option<Duration> {
        effective_timeout(resource.check_cmd_timeout, self.check_cmd_timeout)
    }

    pub fn effective_reload_timeout(&self, resource: &TemplateResource) -> Option<Duration> {
        effective_timeout(resource.reload_cmd_timeout, self.reload_cmd_timeout)
    }
}

fn effective_timeout(override_: Option<Duration>, global_default: Duration) -> Option<Duration> {
    let effective = override_.unwrap_or(global_default);
    if effective.is_zero() {
        None
    } else {
        Some(effective)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(check_timeout: Option<Duration>) -> TemplateResource {
        TemplateResource {
            name: "r".into(),
            src: "r.tmpl".into(),
            dest: "/etc/r.conf".into(),
            keys: vec![],
            mode: resource::FileMode::default(),
            uid: None,
            gid: None,
            prefix: None,
            check_cmd: None,
            reload_cmd: None,
            check_cmd_timeout: check_timeout,
            reload_cmd_timeout: None,
            backend_override: None,
        }
    }

    #[test]
    fn test_effective_timeout_prefers_resource_override() {
        let got = effective_timeout(Some(Duration::from_secs(5)), Duration::from_secs(1));
        assert_eq!(got, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_effective_timeout_falls_back_to_global() {
        let got = effective_timeout(None, Duration::from_secs(1));
        assert_eq!(got, Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_effective_timeout_zero_disables() {
        let got = effective_timeout(None, Duration::from_secs(0));
        assert_eq!(got, None);
    }

    #[test]
    fn test_effective_backend_uses_override() {
        let mut r = resource(None);
        r.backend_override = Some(BackendConfig::Env);
        let global = GlobalConfig {
            confdir: "/etc/confr".into(),
            templates_dir: "/etc/confr/templates".into(),
            mode: RunMode::Onetime,
            failure_mode: FailureMode::BestEffort,
            check_cmd_timeout: Duration::from_secs(3),
            reload_cmd_timeout: Duration::from_secs(3),
            default_backend: BackendConfig::File {
                path: "/tmp".into(),
                filter: "*.yaml".into(),
            },
            backend_supports_watch: false,
            metrics_addr: None,
        };
        assert_eq!(global.effective_backend(&r), &BackendConfig::Env);
    }
}
