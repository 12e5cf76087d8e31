//! Nginx configuration applier
//!
//! Turns a host or upstream row into a config file under the nginx config
//! directory, reloads nginx and records the outcome on the row:
//!
//! 1. render the assigned template (failure: status `error`, file untouched)
//! 2. write `hosts/host_<id>.conf` or `upstreams/upstream_<id>.conf`
//! 3. reload nginx (failure: file replaced by a comment stub, status `error`)
//! 4. status `ok`
//!
//! Disabled hosts are rendered and written but nginx is not reloaded.

use crate::config::NginxConfig;
use crate::db::Database;
use crate::error::{Error, ExternalProcessError, RenderError};
use crate::events::{Change, ChangeNotifier};
use crate::models::{CertificatePaths, ConfigStatus};
use crate::process;
use crate::template::{render_template, TemplateData};
use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Makes nginx pick up changed config files
#[async_trait]
pub trait ConfigReloader: Send + Sync {
    async fn reload(&self) -> Result<(), ExternalProcessError>;
}

/// Reloads by running the nginx binary (`nginx -s reload` by default)
pub struct NginxReloader {
    binary: String,
    args: Vec<String>,
}

impl NginxReloader {
    pub fn new(config: &NginxConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            args: config.reload_args.clone(),
        }
    }
}

#[async_trait]
impl ConfigReloader for NginxReloader {
    async fn reload(&self) -> Result<(), ExternalProcessError> {
        let output = process::run(&self.binary, &self.args).await?;
        debug!(output = %output.trim(), "nginx reloaded");
        Ok(())
    }
}

/// Terminal status of one apply
#[derive(Debug, Clone, PartialEq)]
struct Outcome {
    status: ConfigStatus,
    error_message: String,
}

impl Outcome {
    fn ok() -> Self {
        Self {
            status: ConfigStatus::Ok,
            error_message: String::new(),
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: ConfigStatus::Error,
            error_message: message,
        }
    }

    fn into_result(self, entity: &str) -> anyhow::Result<()> {
        match self.status {
            ConfigStatus::Error => anyhow::bail!("{}: {}", entity, self.error_message),
            _ => Ok(()),
        }
    }
}

pub struct NginxApplier {
    db: Arc<Database>,
    reloader: Arc<dyn ConfigReloader>,
    events: ChangeNotifier,
    nginx: NginxConfig,
    paths: CertificatePaths,
}

impl NginxApplier {
    pub fn new(
        db: Arc<Database>,
        reloader: Arc<dyn ConfigReloader>,
        events: ChangeNotifier,
        nginx: NginxConfig,
        paths: CertificatePaths,
    ) -> Self {
        Self {
            db,
            reloader,
            events,
            nginx,
            paths,
        }
    }

    pub fn host_config_path(&self, id: i64) -> PathBuf {
        self.nginx.hosts_dir().join(format!("host_{}.conf", id))
    }

    pub fn upstream_config_path(&self, id: i64) -> PathBuf {
        self.nginx.upstreams_dir().join(format!("upstream_{}.conf", id))
    }

    /// Render, write and reload the config for a host, then record the result
    pub async fn configure_host(&self, id: i64) -> anyhow::Result<()> {
        let mut host = self.db.get_host(id)?.ok_or_else(|| Error::not_found("host", id))?;
        self.db.expand_host(&mut host)?;

        let data = TemplateData::for_host(&host, &self.nginx.conf_dir, &self.paths);
        let template = host.nginx_template.as_ref().map(|t| t.template.as_str());
        let path = self.host_config_path(id);

        let outcome = self.apply(&path, template, &data, !host.is_disabled).await;
        info!(host_id = id, status = %outcome.status, disabled = host.is_disabled, "Host configured");

        self.db
            .update_host_status(id, outcome.status, &outcome.error_message)
            .with_context(|| format!("Failed to persist status of host #{}", id))?;
        self.events.send_change(Change::Hosts);

        outcome.into_result(&format!("host #{}", id))
    }

    /// Render, write and reload the config for an upstream, then record the result
    pub async fn configure_upstream(&self, id: i64) -> anyhow::Result<()> {
        let mut upstream = self.db.get_upstream(id)?.ok_or_else(|| Error::not_found("upstream", id))?;
        self.db.expand_upstream(&mut upstream)?;

        let data = TemplateData::for_upstream(&upstream, &self.nginx.conf_dir, &self.paths.data_dir);
        let template = upstream.nginx_template.as_ref().map(|t| t.template.as_str());
        let path = self.upstream_config_path(id);

        let outcome = self.apply(&path, template, &data, true).await;
        info!(upstream_id = id, status = %outcome.status, "Upstream configured");

        self.db
            .update_upstream_status(id, outcome.status, &outcome.error_message)
            .with_context(|| format!("Failed to persist status of upstream #{}", id))?;
        self.events.send_change(Change::Upstreams);

        outcome.into_result(&format!("upstream #{}", id))
    }

    /// Delete a host's config file and reload
    pub async fn remove_host(&self, id: i64) -> anyhow::Result<()> {
        self.remove_config(&self.host_config_path(id)).await?;
        self.events.send_change(Change::Hosts);
        Ok(())
    }

    /// Delete an upstream's config file and reload
    pub async fn remove_upstream(&self, id: i64) -> anyhow::Result<()> {
        self.remove_config(&self.upstream_config_path(id)).await?;
        self.events.send_change(Change::Upstreams);
        Ok(())
    }

    async fn apply<T: Serialize>(&self, path: &Path, template: Option<&str>, data: &T, reload: bool) -> Outcome {
        let rendered = match template {
            Some(source) => render_template(source, data),
            None => Err(RenderError("no nginx template assigned".to_string())),
        };

        let rendered = match rendered {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Template generation failed");
                return Outcome::error(format!("Template generation failed: {}", e));
            }
        };

        if let Err(e) = write_config(path, &rendered).await {
            error!(path = %path.display(), error = %e, "Failed to write config file");
            return Outcome::error(format!("Failed to write {}: {}", path.display(), e));
        }

        if !reload {
            debug!(path = %path.display(), "Config written, reload skipped");
            return Outcome::ok();
        }

        match self.reloader.reload().await {
            Ok(()) => Outcome::ok(),
            Err(e) => {
                let detail = e.diagnostic();
                warn!(path = %path.display(), error = %detail, "nginx rejected configuration");

                // Leave a stub so the broken config can't break the next reload
                if let Err(write_err) = write_config(path, &error_stub(&detail)).await {
                    error!(path = %path.display(), error = %write_err, "Failed to write error stub");
                }
                Outcome::error(format!("Nginx configuration error: {}", detail))
            }
        }
    }

    async fn remove_config(&self, path: &Path) -> anyhow::Result<()> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => info!(path = %path.display(), "Removed config file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Config file already absent");
                return Ok(());
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }

        self.reloader
            .reload()
            .await
            .map_err(|e| anyhow::anyhow!("Nginx configuration error: {}", e.diagnostic()))
    }
}

/// Replace `path` with `contents` without ever leaving a half-written file
async fn write_config(path: &Path, contents: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp = path.with_extension("conf.tmp");
    let result = match tokio::fs::write(&tmp, contents).await {
        Ok(()) => tokio::fs::rename(&tmp, path).await,
        Err(e) => Err(e),
    };
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

fn error_stub(detail: &str) -> String {
    let mut stub = String::from("# Nginx configuration error:\n");
    for line in detail.lines() {
        stub.push_str("# ");
        stub.push_str(line);
        stub.push('\n');
    }
    stub
}
