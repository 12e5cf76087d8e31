//! Entity records and the views handed to config templates
//!
//! Records mirror the database rows. The `*Template` structs are what the
//! handlebars templates see; their field names are PascalCase so templates
//! read `{{Host.IsDisabled}}` or `{{Certificate.Folder}}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $value),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum! {
    /// How a certificate is obtained
    CertificateType {
        Custom => "custom",
        Http => "http",
        Dns => "dns",
        Mkcert => "mkcert",
    }
}

string_enum! {
    /// Issuance state of a certificate
    CertificateStatus {
        Ready => "ready",
        Requesting => "requesting",
        Failed => "failed",
        Provided => "provided",
    }
}

string_enum! {
    /// Configuration state of a host or upstream
    ConfigStatus {
        Ready => "ready",
        Ok => "ok",
        Error => "error",
    }
}

string_enum! {
    HostType {
        Proxy => "proxy",
        Redirection => "redirection",
        Dead => "dead",
    }
}

string_enum! {
    /// Entity kind a template renders
    TemplateType {
        Proxy => "proxy",
        Redirection => "redirection",
        Dead => "dead",
        Upstream => "upstream",
    }
}

impl CertificateType {
    /// Types issued through acme.sh
    pub fn is_acme(&self) -> bool {
        matches!(self, Self::Http | Self::Dns)
    }
}

/// ACME certificate authority
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CertificateAuthority {
    pub id: i64,
    pub name: String,
    /// Directory URL passed to acme.sh `--server`
    pub acmesh_server: String,
    /// Optional CA bundle passed to acme.sh `--ca-bundle`
    pub ca_bundle: String,
    pub max_domains: i64,
    pub is_wildcard_supported: bool,
}

/// DNS provider used for DNS-01 validation
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DnsProvider {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    /// acme.sh dns api name, e.g. `dns_cf`
    pub acmesh_name: String,
    /// Seconds acme.sh waits for DNS propagation (0 = acme.sh default)
    pub dns_sleep: i64,
    /// Credentials, keyed by the environment variable acme.sh expects
    pub meta: serde_json::Value,
}

impl DnsProvider {
    /// Environment variables acme.sh needs for this provider
    ///
    /// String values are passed through, numbers and booleans are
    /// stringified, anything else is skipped. Sorted by name.
    pub fn acme_env_vars(&self) -> Vec<(String, String)> {
        let Some(map) = self.meta.as_object() else {
            return Vec::new();
        };

        let mut vars: Vec<(String, String)> = map
            .iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((key.clone(), value))
            })
            .collect();
        vars.sort();
        vars
    }
}

/// User-editable nginx config template
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NginxTemplate {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub template_type: TemplateType,
    pub template: String,
}

/// Filesystem roots certificates are resolved against
#[derive(Debug, Clone)]
pub struct CertificatePaths {
    pub data_dir: PathBuf,
    pub cert_home: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Certificate {
    pub id: i64,
    pub user_id: i64,
    #[serde(rename = "type")]
    pub cert_type: CertificateType,
    /// 0 when no authority is assigned
    pub certificate_authority_id: i64,
    /// 0 when no provider is assigned
    pub dns_provider_id: i64,
    pub name: String,
    pub domain_names: Vec<String>,
    pub expires_on: Option<DateTime<Utc>>,
    pub status: CertificateStatus,
    pub error_message: String,
    pub is_ecc: bool,
    #[serde(default)]
    pub meta: serde_json::Value,
    #[serde(default)]
    pub is_deleted: bool,

    // Expansions
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub certificate_authority: Option<CertificateAuthority>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub dns_provider: Option<DnsProvider>,
}

impl Certificate {
    pub fn new(cert_type: CertificateType, name: &str, domain_names: &[&str]) -> Self {
        Self {
            id: 0,
            user_id: 1,
            cert_type,
            certificate_authority_id: 0,
            dns_provider_id: 0,
            name: name.to_string(),
            domain_names: domain_names.iter().map(|d| d.to_string()).collect(),
            expires_on: None,
            status: CertificateStatus::Ready,
            error_message: String::new(),
            is_ecc: false,
            meta: serde_json::Value::Null,
            is_deleted: false,
            certificate_authority: None,
            dns_provider: None,
        }
    }

    /// Check the type/authority/provider combination
    pub fn validate(&self) -> Result<(), String> {
        let valid = match self.cert_type {
            CertificateType::Custom => {
                self.dns_provider_id == 0 && self.certificate_authority_id == 0
            }
            CertificateType::Http => {
                self.dns_provider_id == 0 && self.certificate_authority_id > 0
            }
            CertificateType::Dns => {
                self.dns_provider_id > 0 && self.certificate_authority_id > 0
            }
            CertificateType::Mkcert => true,
        };

        if !valid {
            return Err(format!(
                "Certificate data is incorrect or incomplete for type '{}'",
                self.cert_type
            ));
        }
        if self.cert_type != CertificateType::Custom && self.domain_names.is_empty() {
            return Err("Certificate requires at least one domain name".to_string());
        }
        Ok(())
    }

    /// Folder holding `fullchain.pem` and `privkey.pem` for this certificate
    pub fn folder(&self, paths: &CertificatePaths) -> PathBuf {
        match self.cert_type {
            CertificateType::Custom => paths.data_dir.join("custom_ssl").join(format!("npm-{}", self.id)),
            _ => paths.cert_home.join(format!("npm-{}", self.id)),
        }
    }

    pub fn fullchain_file(&self, paths: &CertificatePaths) -> PathBuf {
        self.folder(paths).join("fullchain.pem")
    }

    pub fn key_file(&self, paths: &CertificatePaths) -> PathBuf {
        self.folder(paths).join("privkey.pem")
    }

    pub fn template(&self, paths: &CertificatePaths) -> CertificateTemplate {
        if self.id == 0 {
            return CertificateTemplate::default();
        }

        CertificateTemplate {
            id: self.id,
            name: self.name.clone(),
            cert_type: self.cert_type.as_str().to_string(),
            domain_names: self.domain_names.clone(),
            status: self.status.as_str().to_string(),
            expires_on: self
                .expires_on
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default(),
            certificate_authority_id: self.certificate_authority_id,
            dns_provider_id: self.dns_provider_id,
            is_ecc: self.is_ecc,
            is_custom: self.cert_type == CertificateType::Custom,
            is_acme: self.cert_type != CertificateType::Custom,
            is_provided: self.status == CertificateStatus::Provided,
            folder: path_string(&self.folder(paths)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CertificateTemplate {
    #[serde(rename = "ID")]
    pub id: i64,
    pub name: String,
    #[serde(rename = "Type")]
    pub cert_type: String,
    pub domain_names: Vec<String>,
    pub status: String,
    pub expires_on: String,
    #[serde(rename = "CertificateAuthorityID")]
    pub certificate_authority_id: i64,
    #[serde(rename = "DNSProviderID")]
    pub dns_provider_id: i64,
    #[serde(rename = "IsECC")]
    pub is_ecc: bool,
    pub is_custom: bool,
    pub is_acme: bool,
    pub is_provided: bool,
    pub folder: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub id: i64,
    pub user_id: i64,
    #[serde(rename = "type")]
    pub host_type: HostType,
    pub nginx_template_id: i64,
    pub listen_interface: String,
    pub domain_names: Vec<String>,
    pub upstream_id: i64,
    pub certificate_id: i64,
    pub ssl_forced: bool,
    pub caching_enabled: bool,
    pub block_exploits: bool,
    pub allow_websocket_upgrade: bool,
    pub http2_support: bool,
    pub hsts_enabled: bool,
    pub hsts_subdomains: bool,
    pub paths: String,
    pub advanced_config: String,
    pub status: ConfigStatus,
    pub error_message: String,
    pub is_disabled: bool,
    #[serde(default)]
    pub is_deleted: bool,

    // Expansions
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub certificate: Option<Certificate>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nginx_template: Option<NginxTemplate>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub upstream: Option<Upstream>,
}

impl Host {
    pub fn new(host_type: HostType, domain_names: &[&str]) -> Self {
        Self {
            id: 0,
            user_id: 1,
            host_type,
            nginx_template_id: 0,
            listen_interface: String::new(),
            domain_names: domain_names.iter().map(|d| d.to_string()).collect(),
            upstream_id: 0,
            certificate_id: 0,
            ssl_forced: false,
            caching_enabled: false,
            block_exploits: false,
            allow_websocket_upgrade: false,
            http2_support: false,
            hsts_enabled: false,
            hsts_subdomains: false,
            paths: String::new(),
            advanced_config: String::new(),
            status: ConfigStatus::Ready,
            error_message: String::new(),
            is_disabled: false,
            is_deleted: false,
            certificate: None,
            nginx_template: None,
            upstream: None,
        }
    }

    pub fn template(&self) -> HostTemplate {
        HostTemplate {
            id: self.id,
            host_type: self.host_type.as_str().to_string(),
            listen_interface: self.listen_interface.clone(),
            domain_names: self.domain_names.clone(),
            upstream_id: self.upstream_id,
            certificate_id: self.certificate_id,
            ssl_forced: self.ssl_forced,
            caching_enabled: self.caching_enabled,
            block_exploits: self.block_exploits,
            allow_websocket_upgrade: self.allow_websocket_upgrade,
            http2_support: self.http2_support,
            hsts_enabled: self.hsts_enabled,
            hsts_subdomains: self.hsts_subdomains,
            paths: self.paths.clone(),
            advanced_config: self.advanced_config.clone(),
            is_disabled: self.is_disabled,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct HostTemplate {
    #[serde(rename = "ID")]
    pub id: i64,
    #[serde(rename = "Type")]
    pub host_type: String,
    pub listen_interface: String,
    pub domain_names: Vec<String>,
    #[serde(rename = "UpstreamID")]
    pub upstream_id: i64,
    #[serde(rename = "CertificateID")]
    pub certificate_id: i64,
    #[serde(rename = "SSLForced")]
    pub ssl_forced: bool,
    pub caching_enabled: bool,
    pub block_exploits: bool,
    pub allow_websocket_upgrade: bool,
    #[serde(rename = "HTTP2Support")]
    pub http2_support: bool,
    #[serde(rename = "HSTSEnabled")]
    pub hsts_enabled: bool,
    #[serde(rename = "HSTSSubdomains")]
    pub hsts_subdomains: bool,
    pub paths: String,
    pub advanced_config: String,
    pub is_disabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpstreamServer {
    pub id: i64,
    pub upstream_id: i64,
    /// `host:port` or unix socket path
    pub server: String,
    pub weight: i64,
    pub max_conns: i64,
    pub max_fails: i64,
    pub fail_timeout: i64,
    pub backup: bool,
}

impl UpstreamServer {
    pub fn new(server: &str) -> Self {
        Self {
            server: server.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Upstream {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub nginx_template_id: i64,
    pub ip_hash: bool,
    pub ntlm: bool,
    pub keepalive: i64,
    pub keepalive_requests: i64,
    pub keepalive_time: String,
    pub keepalive_timeout: String,
    pub advanced_config: String,
    pub status: ConfigStatus,
    pub error_message: String,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub servers: Vec<UpstreamServer>,

    // Expansions
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub nginx_template: Option<NginxTemplate>,
}

impl Upstream {
    pub fn new(name: &str, servers: &[&str]) -> Self {
        Self {
            id: 0,
            user_id: 1,
            name: name.to_string(),
            nginx_template_id: 0,
            ip_hash: false,
            ntlm: false,
            keepalive: 0,
            keepalive_requests: 0,
            keepalive_time: String::new(),
            keepalive_timeout: String::new(),
            advanced_config: String::new(),
            status: ConfigStatus::Ready,
            error_message: String::new(),
            is_deleted: false,
            servers: servers.iter().map(|s| UpstreamServer::new(s)).collect(),
            nginx_template: None,
        }
    }

    pub fn template(&self) -> UpstreamTemplate {
        UpstreamTemplate {
            id: self.id,
            name: self.name.clone(),
            ip_hash: self.ip_hash,
            ntlm: self.ntlm,
            keepalive: self.keepalive,
            keepalive_requests: self.keepalive_requests,
            keepalive_time: self.keepalive_time.clone(),
            keepalive_timeout: self.keepalive_timeout.clone(),
            advanced_config: self.advanced_config.clone(),
            servers: self
                .servers
                .iter()
                .map(|s| UpstreamServerTemplate {
                    server: s.server.clone(),
                    weight: s.weight,
                    max_conns: s.max_conns,
                    max_fails: s.max_fails,
                    fail_timeout: s.fail_timeout,
                    backup: s.backup,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct UpstreamTemplate {
    #[serde(rename = "ID")]
    pub id: i64,
    pub name: String,
    #[serde(rename = "IPHash")]
    pub ip_hash: bool,
    #[serde(rename = "NTLM")]
    pub ntlm: bool,
    pub keepalive: i64,
    pub keepalive_requests: i64,
    pub keepalive_time: String,
    pub keepalive_timeout: String,
    pub advanced_config: String,
    pub servers: Vec<UpstreamServerTemplate>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct UpstreamServerTemplate {
    pub server: String,
    pub weight: i64,
    pub max_conns: i64,
    pub max_fails: i64,
    pub fail_timeout: i64,
    pub backup: bool,
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> CertificatePaths {
        CertificatePaths {
            data_dir: PathBuf::from("/data"),
            cert_home: PathBuf::from("/data/.acme.sh/certs"),
        }
    }

    #[test]
    fn test_enum_round_trip_strings() {
        assert_eq!(CertificateType::parse("dns"), Some(CertificateType::Dns));
        assert_eq!(CertificateType::parse("DNS"), None);
        assert_eq!(CertificateStatus::Requesting.as_str(), "requesting");
        assert_eq!(ConfigStatus::parse("error"), Some(ConfigStatus::Error));
        assert_eq!(TemplateType::Upstream.to_string(), "upstream");
        assert!(CertificateType::Http.is_acme());
        assert!(!CertificateType::Mkcert.is_acme());
    }

    #[test]
    fn test_certificate_validate() {
        let mut cert = Certificate::new(CertificateType::Custom, "custom", &[]);
        assert!(cert.validate().is_ok());

        cert.cert_type = CertificateType::Http;
        cert.domain_names = vec!["example.com".to_string()];
        assert!(cert.validate().is_err(), "http requires a CA");
        cert.certificate_authority_id = 1;
        assert!(cert.validate().is_ok());

        cert.cert_type = CertificateType::Dns;
        assert!(cert.validate().is_err(), "dns requires a provider");
        cert.dns_provider_id = 2;
        assert!(cert.validate().is_ok());

        cert.domain_names.clear();
        assert!(cert.validate().is_err());
    }

    #[test]
    fn test_certificate_folders() {
        let mut cert = Certificate::new(CertificateType::Custom, "custom", &[]);
        cert.id = 66;
        assert_eq!(cert.folder(&paths()), PathBuf::from("/data/custom_ssl/npm-66"));

        cert.cert_type = CertificateType::Http;
        cert.id = 77;
        assert_eq!(cert.fullchain_file(&paths()), PathBuf::from("/data/.acme.sh/certs/npm-77/fullchain.pem"));
        assert_eq!(cert.key_file(&paths()), PathBuf::from("/data/.acme.sh/certs/npm-77/privkey.pem"));
    }

    #[test]
    fn test_certificate_template() {
        let unsaved = Certificate::new(CertificateType::Http, "web", &["example.com"]);
        assert_eq!(unsaved.template(&paths()), CertificateTemplate::default());

        let mut cert = Certificate::new(CertificateType::Http, "web", &["example.com"]);
        cert.id = 77;
        cert.certificate_authority_id = 99;
        cert.status = CertificateStatus::Provided;

        let template = cert.template(&paths());
        assert!(template.is_provided);
        assert!(template.is_acme);
        assert!(!template.is_custom);
        assert_eq!(template.folder, "/data/.acme.sh/certs/npm-77");

        let json = serde_json::to_value(&template).unwrap();
        assert_eq!(json["ID"], 77);
        assert_eq!(json["CertificateAuthorityID"], 99);
        assert_eq!(json["IsProvided"], true);
    }

    #[test]
    fn test_host_template_field_names() {
        let mut host = Host::new(HostType::Proxy, &["example.com"]);
        host.is_disabled = true;
        host.http2_support = true;

        let json = serde_json::to_value(host.template()).unwrap();
        assert_eq!(json["IsDisabled"], true);
        assert_eq!(json["HTTP2Support"], true);
        assert_eq!(json["DomainNames"][0], "example.com");
        assert_eq!(json["Type"], "proxy");
    }

    #[test]
    fn test_dns_provider_env_vars() {
        let provider = DnsProvider {
            acmesh_name: "dns_cf".to_string(),
            meta: serde_json::json!({
                "CF_Token": "secret",
                "CF_Account_ID": 12345,
                "CF_Debug": false,
                "nested": {"ignored": true},
                "empty": null,
            }),
            ..Default::default()
        };

        assert_eq!(
            provider.acme_env_vars(),
            vec![
                ("CF_Account_ID".to_string(), "12345".to_string()),
                ("CF_Debug".to_string(), "false".to_string()),
                ("CF_Token".to_string(), "secret".to_string()),
            ]
        );

        let no_meta = DnsProvider::default();
        assert!(no_meta.acme_env_vars().is_empty());
    }

    #[test]
    fn test_upstream_template_servers() {
        let mut upstream = Upstream::new("backend", &["10.0.0.1:8080", "10.0.0.2:8080"]);
        upstream.servers[1].backup = true;
        upstream.ip_hash = true;

        let json = serde_json::to_value(upstream.template()).unwrap();
        assert_eq!(json["IPHash"], true);
        assert_eq!(json["Servers"].as_array().unwrap().len(), 2);
        assert_eq!(json["Servers"][1]["Backup"], true);
        assert_eq!(json["Servers"][0]["Server"], "10.0.0.1:8080");
    }
}
