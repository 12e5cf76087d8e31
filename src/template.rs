//! Nginx config rendering
//!
//! Templates are handlebars. Output is never HTML-escaped, and block tags
//! that sit alone on a line take their line break with them, so a template
//! can be laid out readably without leaving blank lines in the result.

use crate::error::RenderError;
use crate::models::{CertificatePaths, CertificateTemplate, Host, HostTemplate, Upstream, UpstreamTemplate};
use handlebars::Handlebars;
use serde::Serialize;
use std::path::Path;

/// Everything a template can reference
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TemplateData {
    pub conf_dir: String,
    pub data_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<HostTemplate>,
    pub certificate: CertificateTemplate,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<UpstreamTemplate>,
}

impl TemplateData {
    /// Data for a host config; `host` should already be expanded
    pub fn for_host(host: &Host, conf_dir: &Path, paths: &CertificatePaths) -> Self {
        Self {
            conf_dir: conf_dir.to_string_lossy().into_owned(),
            data_dir: paths.data_dir.to_string_lossy().into_owned(),
            host: Some(host.template()),
            certificate: host
                .certificate
                .as_ref()
                .map(|cert| cert.template(paths))
                .unwrap_or_default(),
            upstream: host.upstream.as_ref().map(Upstream::template),
        }
    }

    pub fn for_upstream(upstream: &Upstream, conf_dir: &Path, data_dir: &Path) -> Self {
        Self {
            conf_dir: conf_dir.to_string_lossy().into_owned(),
            data_dir: data_dir.to_string_lossy().into_owned(),
            host: None,
            certificate: CertificateTemplate::default(),
            upstream: Some(upstream.template()),
        }
    }
}

/// Render `source` against `data`
pub fn render_template<T: Serialize>(source: &str, data: &T) -> Result<String, RenderError> {
    let mut registry = Handlebars::new();
    registry.register_escape_fn(handlebars::no_escape);
    Ok(registry.render_template(source, data)?)
}
