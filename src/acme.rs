//! ACME certificate issuance through acme.sh
//!
//! Certificates of type `http` and `dns` are issued by shelling out to the
//! acme.sh script. This module builds its argument list and environment,
//! runs it through the process adapter and reads the expiry of whatever it
//! wrote.

use crate::config::AcmeConfig;
use crate::error::ExternalProcessError;
use crate::models::{Certificate, CertificateType};
use crate::process;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum AcmeError {
    #[error("DNS method requires a DNS provider")]
    DnsNeedsProvider,

    #[error("HTTP method does not support a DNS provider")]
    HttpHasProvider,

    #[error("method '{0}' is not supported by acme.sh")]
    MethodNotSupported(String),

    #[error("certificate has no domain names")]
    NoDomains,

    #[error("failed to create certificate folder {}: {}", .path.display(), .source)]
    Folder {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Process(#[from] ExternalProcessError),
}

impl AcmeError {
    /// Message stored on a certificate that failed to issue
    pub fn diagnostic(&self) -> String {
        match self {
            Self::Process(e) => e.diagnostic(),
            other => other.to_string(),
        }
    }
}

/// Something that can obtain a certificate for an expanded [`Certificate`]
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Issue `cert`, writing the chain to `fullchain_file` and the key to
    /// `key_file`. Returns the issuer's output on success.
    async fn issue(&self, cert: &Certificate, fullchain_file: &Path, key_file: &Path) -> Result<String, AcmeError>;
}

/// The acme.sh script
pub struct AcmeSh {
    config: AcmeConfig,
}

impl AcmeSh {
    pub fn new(config: AcmeConfig) -> Self {
        Self { config }
    }

    /// Build the `--issue` argument list for `cert`
    ///
    /// The method flags (`-w` or `--dns`) must follow the first `-d` and are
    /// not repeated for the remaining domains.
    pub fn issue_args(&self, cert: &Certificate, fullchain_file: &Path, key_file: &Path) -> Result<Vec<String>, AcmeError> {
        let method_args = match cert.cert_type {
            CertificateType::Dns => {
                let provider = cert.dns_provider.as_ref().ok_or(AcmeError::DnsNeedsProvider)?;
                let mut args = vec!["--dns".to_string(), provider.acmesh_name.clone()];
                if provider.dns_sleep > 0 {
                    args.push("--dnssleep".to_string());
                    args.push(provider.dns_sleep.to_string());
                }
                args
            }
            CertificateType::Http => {
                if cert.dns_provider.is_some() {
                    return Err(AcmeError::HttpHasProvider);
                }
                vec!["-w".to_string(), self.config.webroot.display().to_string()]
            }
            other => return Err(AcmeError::MethodNotSupported(other.to_string())),
        };

        if cert.domain_names.is_empty() {
            return Err(AcmeError::NoDomains);
        }

        let mut args = vec![
            "--issue".to_string(),
            "--log".to_string(),
            self.config.log_file.display().to_string(),
        ];

        if let Some(ca) = &cert.certificate_authority {
            if !ca.acmesh_server.is_empty() {
                args.push("--server".to_string());
                args.push(ca.acmesh_server.clone());
            }
            if !ca.ca_bundle.is_empty() {
                args.push("--ca-bundle".to_string());
                args.push(ca.ca_bundle.clone());
            }
        }

        args.push("--fullchain-file".to_string());
        args.push(fullchain_file.display().to_string());
        args.push("--key-file".to_string());
        args.push(key_file.display().to_string());

        if cert.is_ecc {
            args.push("--keylength".to_string());
            args.push("ec-256".to_string());
        }

        let mut method_args = Some(method_args);
        for domain in &cert.domain_names {
            args.push("-d".to_string());
            args.push(domain.clone());
            if let Some(method) = method_args.take() {
                args.extend(method);
            }
        }

        Ok(args)
    }
}

#[async_trait]
impl CertificateIssuer for AcmeSh {
    async fn issue(&self, cert: &Certificate, fullchain_file: &Path, key_file: &Path) -> Result<String, AcmeError> {
        let args = self.issue_args(cert, fullchain_file, key_file)?;
        let envs = cert
            .dns_provider
            .as_ref()
            .map(|provider| provider.acme_env_vars())
            .unwrap_or_default();

        info!(
            certificate_id = cert.id,
            domains = ?cert.domain_names,
            method = %cert.cert_type,
            "Requesting certificate from acme.sh"
        );

        let output = process::run_with_env(&self.config.script, &args, &envs).await?;
        debug!(certificate_id = cert.id, output = %output.trim(), "acme.sh finished");
        Ok(output)
    }
}

/// Expiry of the first certificate in a PEM file
pub async fn read_certificate_expiry(path: &Path) -> Option<DateTime<Utc>> {
    use x509_parser::prelude::*;

    let data = tokio::fs::read(path).await.ok()?;
    let mut reader = BufReader::new(data.as_slice());
    let der = rustls_pemfile::certs(&mut reader).next()?.ok()?;

    let (_, parsed) = match X509Certificate::from_der(der.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            error!(path = %path.display(), error = %e, "Failed to parse X.509 certificate");
            return None;
        }
    };

    DateTime::from_timestamp(parsed.validity().not_after.timestamp(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CertificateAuthority, DnsProvider};

    fn acme() -> AcmeSh {
        AcmeSh::new(AcmeConfig::default())
    }

    fn files() -> (PathBuf, PathBuf) {
        (
            PathBuf::from("/data/.acme.sh/certs/npm-1/fullchain.pem"),
            PathBuf::from("/data/.acme.sh/certs/npm-1/privkey.pem"),
        )
    }

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_http_args() {
        let cert = Certificate::new(CertificateType::Http, "web", &["example.com", "www.example.com"]);
        let (fullchain, key) = files();

        let args = acme().issue_args(&cert, &fullchain, &key).unwrap();
        assert_eq!(
            args,
            strings(&[
                "--issue",
                "--log",
                "/data/logs/acme.sh.log",
                "--fullchain-file",
                "/data/.acme.sh/certs/npm-1/fullchain.pem",
                "--key-file",
                "/data/.acme.sh/certs/npm-1/privkey.pem",
                "-d",
                "example.com",
                "-w",
                "/data/acme/wellknown",
                "-d",
                "www.example.com",
            ])
        );
    }

    #[test]
    fn test_dns_args_with_authority() {
        let mut cert = Certificate::new(CertificateType::Dns, "wild", &["*.example.com"]);
        cert.is_ecc = true;
        cert.certificate_authority = Some(CertificateAuthority {
            acmesh_server: "https://acme.zerossl.com/v2/DV90".to_string(),
            ca_bundle: "/etc/ssl/ca.pem".to_string(),
            ..Default::default()
        });
        cert.dns_provider = Some(DnsProvider {
            acmesh_name: "dns_cf".to_string(),
            dns_sleep: 120,
            ..Default::default()
        });
        let (fullchain, key) = files();

        let args = acme().issue_args(&cert, &fullchain, &key).unwrap();
        assert_eq!(
            args,
            strings(&[
                "--issue",
                "--log",
                "/data/logs/acme.sh.log",
                "--server",
                "https://acme.zerossl.com/v2/DV90",
                "--ca-bundle",
                "/etc/ssl/ca.pem",
                "--fullchain-file",
                "/data/.acme.sh/certs/npm-1/fullchain.pem",
                "--key-file",
                "/data/.acme.sh/certs/npm-1/privkey.pem",
                "--keylength",
                "ec-256",
                "-d",
                "*.example.com",
                "--dns",
                "dns_cf",
                "--dnssleep",
                "120",
            ])
        );
    }

    #[test]
    fn test_invalid_method_combinations() {
        let (fullchain, key) = files();

        let dns = Certificate::new(CertificateType::Dns, "dns", &["example.com"]);
        assert!(matches!(
            acme().issue_args(&dns, &fullchain, &key),
            Err(AcmeError::DnsNeedsProvider)
        ));

        let mut http = Certificate::new(CertificateType::Http, "http", &["example.com"]);
        http.dns_provider = Some(DnsProvider::default());
        assert!(matches!(
            acme().issue_args(&http, &fullchain, &key),
            Err(AcmeError::HttpHasProvider)
        ));

        let custom = Certificate::new(CertificateType::Custom, "custom", &["example.com"]);
        let err = acme().issue_args(&custom, &fullchain, &key).unwrap_err();
        assert_eq!(err.to_string(), "method 'custom' is not supported by acme.sh");

        let empty = Certificate::new(CertificateType::Http, "empty", &[]);
        assert!(matches!(acme().issue_args(&empty, &fullchain, &key), Err(AcmeError::NoDomains)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_issue_runs_script_with_provider_env() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("acme.sh");
        let record = dir.path().join("invocation");
        std::fs::write(
            &script,
            format!("#!/bin/sh\necho \"$CF_Token $*\" > {}\necho issued\n", record.display()),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let issuer = AcmeSh::new(AcmeConfig {
            script: script.display().to_string(),
            ..AcmeConfig::default()
        });

        let mut cert = Certificate::new(CertificateType::Dns, "dns", &["example.com"]);
        cert.dns_provider = Some(DnsProvider {
            acmesh_name: "dns_cf".to_string(),
            meta: serde_json::json!({"CF_Token": "secret"}),
            ..Default::default()
        });
        let (fullchain, key) = files();

        let output = issuer.issue(&cert, &fullchain, &key).await.unwrap();
        assert_eq!(output, "issued\n");

        let invocation = std::fs::read_to_string(&record).unwrap();
        assert!(invocation.starts_with("secret --issue --log"));
        assert!(invocation.contains("-d example.com --dns dns_cf"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_issue_failure_diagnostic() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("acme.sh");
        std::fs::write(&script, "#!/bin/sh\necho 'Verify error: Invalid response from example.com'\nexit 1\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let issuer = AcmeSh::new(AcmeConfig {
            script: script.display().to_string(),
            ..AcmeConfig::default()
        });
        let cert = Certificate::new(CertificateType::Http, "web", &["example.com"]);
        let (fullchain, key) = files();

        let err = issuer.issue(&cert, &fullchain, &key).await.unwrap_err();
        assert_eq!(err.diagnostic(), "Verify error: Invalid response from example.com");
    }

    #[tokio::test]
    async fn test_read_certificate_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fullchain.pem");

        let rcgen::CertifiedKey { cert, .. } =
            rcgen::generate_simple_self_signed(vec!["example.com".to_string()]).unwrap();
        std::fs::write(&path, cert.pem()).unwrap();

        let expiry = read_certificate_expiry(&path).await.unwrap();
        assert!(expiry > Utc::now());

        std::fs::write(&path, "not a certificate").unwrap();
        assert!(read_certificate_expiry(&path).await.is_none());
        assert!(read_certificate_expiry(&dir.path().join("missing.pem")).await.is_none());
    }
}
