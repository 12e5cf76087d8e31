//! SQLite store for hosts, upstreams and certificates
//!
//! Every row the orchestrator works on lives here. Tasks re-read the row they
//! are about to act on and write back status columns when they finish, so
//! the store is the only state shared between producers and the worker.

use crate::error::{Error, Result};
use crate::models::{
    Certificate, CertificateAuthority, CertificateStatus, CertificateType, ConfigStatus, DnsProvider, Host, HostType,
    NginxTemplate, TemplateType, Upstream, UpstreamServer,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 2;

macro_rules! sql_text_enum {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl ToSql for $ty {
                fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                    Ok(ToSqlOutput::from(self.as_str()))
                }
            }

            impl FromSql for $ty {
                fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                    let s = value.as_str()?;
                    <$ty>::parse(s).ok_or_else(|| FromSqlError::Other(format!("unknown value '{}'", s).into()))
                }
            }
        )+
    };
}

sql_text_enum!(CertificateType, CertificateStatus, ConfigStatus, HostType, TemplateType);

const CERTIFICATE_COLUMNS: &str = "id, user_id, type, certificate_authority_id, dns_provider_id, name,
    domain_names, expires_on, status, error_message, meta, is_ecc, is_deleted";

const HOST_COLUMNS: &str = "id, user_id, type, nginx_template_id, listen_interface, domain_names,
    upstream_id, certificate_id, ssl_forced, caching_enabled, block_exploits, allow_websocket_upgrade,
    http2_support, hsts_enabled, hsts_subdomains, paths, advanced_config, status, error_message,
    is_disabled, is_deleted";

const UPSTREAM_COLUMNS: &str = "id, user_id, name, nginx_template_id, ip_hash, ntlm, keepalive,
    keepalive_requests, keepalive_time, keepalive_timeout, advanced_config, status, error_message, is_deleted";

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path).context("Failed to open database")?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> anyhow::Result<Self> {
        use anyhow::Context;

        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )?;

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
            if current_version < 2 {
                Self::migrate_v2(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: authorities, providers, templates and certificates
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: certificate schema");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS certificate_authority (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_on TEXT NOT NULL DEFAULT (datetime('now')),
                modified_on TEXT NOT NULL DEFAULT (datetime('now')),
                name TEXT NOT NULL,
                acmesh_server TEXT NOT NULL,
                ca_bundle TEXT NOT NULL DEFAULT '',
                max_domains INTEGER NOT NULL DEFAULT 0,
                is_wildcard_supported INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS dns_provider (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_on TEXT NOT NULL DEFAULT (datetime('now')),
                modified_on TEXT NOT NULL DEFAULT (datetime('now')),
                user_id INTEGER NOT NULL DEFAULT 0,
                name TEXT NOT NULL,
                acmesh_name TEXT NOT NULL,
                dns_sleep INTEGER NOT NULL DEFAULT 0,
                meta TEXT NOT NULL DEFAULT '{}',
                is_deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS nginx_template (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_on TEXT NOT NULL DEFAULT (datetime('now')),
                modified_on TEXT NOT NULL DEFAULT (datetime('now')),
                user_id INTEGER NOT NULL DEFAULT 0,
                name TEXT NOT NULL,
                type TEXT NOT NULL,
                template TEXT NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS certificate (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_on TEXT NOT NULL DEFAULT (datetime('now')),
                modified_on TEXT NOT NULL DEFAULT (datetime('now')),
                user_id INTEGER NOT NULL DEFAULT 0,
                type TEXT NOT NULL,
                certificate_authority_id INTEGER NOT NULL DEFAULT 0,
                dns_provider_id INTEGER NOT NULL DEFAULT 0,
                name TEXT NOT NULL,
                domain_names TEXT NOT NULL DEFAULT '[]',
                expires_on TEXT,
                status TEXT NOT NULL DEFAULT 'ready',
                error_message TEXT NOT NULL DEFAULT '',
                meta TEXT NOT NULL DEFAULT '{}',
                is_ecc INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_certificate_status ON certificate(status, is_deleted);

            INSERT INTO schema_migrations (version) VALUES (1);
            "#,
        )?;

        Ok(())
    }

    /// Migration v2: hosts and upstreams
    fn migrate_v2(conn: &Connection) -> Result<()> {
        debug!("Applying migration v2: host and upstream schema");

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS upstream (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_on TEXT NOT NULL DEFAULT (datetime('now')),
                modified_on TEXT NOT NULL DEFAULT (datetime('now')),
                user_id INTEGER NOT NULL DEFAULT 0,
                name TEXT NOT NULL,
                nginx_template_id INTEGER NOT NULL DEFAULT 0,
                ip_hash INTEGER NOT NULL DEFAULT 0,
                ntlm INTEGER NOT NULL DEFAULT 0,
                keepalive INTEGER NOT NULL DEFAULT 0,
                keepalive_requests INTEGER NOT NULL DEFAULT 0,
                keepalive_time TEXT NOT NULL DEFAULT '',
                keepalive_timeout TEXT NOT NULL DEFAULT '',
                advanced_config TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'ready',
                error_message TEXT NOT NULL DEFAULT '',
                is_deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS upstream_server (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_on TEXT NOT NULL DEFAULT (datetime('now')),
                modified_on TEXT NOT NULL DEFAULT (datetime('now')),
                upstream_id INTEGER NOT NULL REFERENCES upstream(id) ON DELETE CASCADE,
                server TEXT NOT NULL,
                weight INTEGER NOT NULL DEFAULT 0,
                max_conns INTEGER NOT NULL DEFAULT 0,
                max_fails INTEGER NOT NULL DEFAULT 0,
                fail_timeout INTEGER NOT NULL DEFAULT 0,
                backup INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS host (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_on TEXT NOT NULL DEFAULT (datetime('now')),
                modified_on TEXT NOT NULL DEFAULT (datetime('now')),
                user_id INTEGER NOT NULL DEFAULT 0,
                type TEXT NOT NULL,
                nginx_template_id INTEGER NOT NULL DEFAULT 0,
                listen_interface TEXT NOT NULL DEFAULT '',
                domain_names TEXT NOT NULL DEFAULT '[]',
                upstream_id INTEGER NOT NULL DEFAULT 0,
                certificate_id INTEGER NOT NULL DEFAULT 0,
                ssl_forced INTEGER NOT NULL DEFAULT 0,
                caching_enabled INTEGER NOT NULL DEFAULT 0,
                block_exploits INTEGER NOT NULL DEFAULT 0,
                allow_websocket_upgrade INTEGER NOT NULL DEFAULT 0,
                http2_support INTEGER NOT NULL DEFAULT 0,
                hsts_enabled INTEGER NOT NULL DEFAULT 0,
                hsts_subdomains INTEGER NOT NULL DEFAULT 0,
                paths TEXT NOT NULL DEFAULT '',
                advanced_config TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'ready',
                error_message TEXT NOT NULL DEFAULT '',
                is_disabled INTEGER NOT NULL DEFAULT 0,
                is_deleted INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_upstream_server_upstream ON upstream_server(upstream_id);
            CREATE INDEX IF NOT EXISTS idx_host_status ON host(status, is_deleted);
            CREATE INDEX IF NOT EXISTS idx_upstream_status ON upstream(status, is_deleted);

            INSERT INTO schema_migrations (version) VALUES (2);
            "#,
        )?;

        Ok(())
    }

    // ==================== Certificate Authorities ====================

    pub fn create_certificate_authority(&self, ca: &mut CertificateAuthority) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO certificate_authority (name, acmesh_server, ca_bundle, max_domains, is_wildcard_supported)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![ca.name, ca.acmesh_server, ca.ca_bundle, ca.max_domains, ca.is_wildcard_supported],
        )?;
        ca.id = conn.last_insert_rowid();
        Ok(ca.id)
    }

    pub fn get_certificate_authority(&self, id: i64) -> Result<Option<CertificateAuthority>> {
        let conn = self.conn.lock();
        let ca = conn
            .query_row(
                "SELECT id, name, acmesh_server, ca_bundle, max_domains, is_wildcard_supported
                 FROM certificate_authority WHERE id = ?1 AND is_deleted = 0",
                params![id],
                |row| {
                    Ok(CertificateAuthority {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        acmesh_server: row.get(2)?,
                        ca_bundle: row.get(3)?,
                        max_domains: row.get(4)?,
                        is_wildcard_supported: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(ca)
    }

    // ==================== DNS Providers ====================

    pub fn create_dns_provider(&self, provider: &mut DnsProvider) -> Result<i64> {
        let meta = serde_json::to_string(&provider.meta)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO dns_provider (user_id, name, acmesh_name, dns_sleep, meta)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![provider.user_id, provider.name, provider.acmesh_name, provider.dns_sleep, meta],
        )?;
        provider.id = conn.last_insert_rowid();
        Ok(provider.id)
    }

    pub fn get_dns_provider(&self, id: i64) -> Result<Option<DnsProvider>> {
        let conn = self.conn.lock();
        let provider = conn
            .query_row(
                "SELECT id, user_id, name, acmesh_name, dns_sleep, meta
                 FROM dns_provider WHERE id = ?1 AND is_deleted = 0",
                params![id],
                |row| {
                    Ok(DnsProvider {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        name: row.get(2)?,
                        acmesh_name: row.get(3)?,
                        dns_sleep: row.get(4)?,
                        meta: json_column(row, 5)?,
                    })
                },
            )
            .optional()?;
        Ok(provider)
    }

    // ==================== Nginx Templates ====================

    pub fn create_nginx_template(&self, template: &mut NginxTemplate) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO nginx_template (user_id, name, type, template) VALUES (?1, ?2, ?3, ?4)",
            params![template.user_id, template.name, template.template_type, template.template],
        )?;
        template.id = conn.last_insert_rowid();
        Ok(template.id)
    }

    pub fn get_nginx_template(&self, id: i64) -> Result<Option<NginxTemplate>> {
        let conn = self.conn.lock();
        let template = conn
            .query_row(
                "SELECT id, user_id, name, type, template FROM nginx_template WHERE id = ?1 AND is_deleted = 0",
                params![id],
                |row| {
                    Ok(NginxTemplate {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        name: row.get(2)?,
                        template_type: row.get(3)?,
                        template: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(template)
    }

    // ==================== Certificates ====================

    /// Insert or update a certificate after checking its type combination
    pub fn save_certificate(&self, cert: &mut Certificate) -> Result<()> {
        cert.validate().map_err(Error::Validation)?;

        let domain_names = serde_json::to_string(&cert.domain_names)?;
        let meta = serde_json::to_string(&cert.meta)?;
        let expires_on = cert.expires_on.map(|t| t.to_rfc3339());

        let conn = self.conn.lock();
        if cert.id == 0 {
            conn.execute(
                "INSERT INTO certificate (user_id, type, certificate_authority_id, dns_provider_id, name,
                    domain_names, expires_on, status, error_message, meta, is_ecc)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    cert.user_id,
                    cert.cert_type,
                    cert.certificate_authority_id,
                    cert.dns_provider_id,
                    cert.name,
                    domain_names,
                    expires_on,
                    cert.status,
                    cert.error_message,
                    meta,
                    cert.is_ecc,
                ],
            )?;
            cert.id = conn.last_insert_rowid();
        } else {
            let rows = conn.execute(
                "UPDATE certificate SET user_id = ?1, type = ?2, certificate_authority_id = ?3,
                    dns_provider_id = ?4, name = ?5, domain_names = ?6, expires_on = ?7, status = ?8,
                    error_message = ?9, meta = ?10, is_ecc = ?11, modified_on = datetime('now')
                 WHERE id = ?12 AND is_deleted = 0",
                params![
                    cert.user_id,
                    cert.cert_type,
                    cert.certificate_authority_id,
                    cert.dns_provider_id,
                    cert.name,
                    domain_names,
                    expires_on,
                    cert.status,
                    cert.error_message,
                    meta,
                    cert.is_ecc,
                    cert.id,
                ],
            )?;
            if rows == 0 {
                return Err(Error::not_found("certificate", cert.id));
            }
        }
        Ok(())
    }

    pub fn get_certificate(&self, id: i64) -> Result<Option<Certificate>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM certificate WHERE id = ?1 AND is_deleted = 0", CERTIFICATE_COLUMNS);
        let cert = conn.query_row(&sql, params![id], certificate_from_row).optional()?;
        Ok(cert)
    }

    /// Load the certificate authority and DNS provider a certificate points at
    pub fn expand_certificate(&self, cert: &mut Certificate) -> Result<()> {
        cert.certificate_authority = match cert.certificate_authority_id {
            0 => None,
            id => self.get_certificate_authority(id)?,
        };
        cert.dns_provider = match cert.dns_provider_id {
            0 => None,
            id => self.get_dns_provider(id)?,
        };
        Ok(())
    }

    /// Write the issuance outcome columns of a certificate
    pub fn update_certificate_status(
        &self,
        id: i64,
        status: CertificateStatus,
        error_message: &str,
        expires_on: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE certificate SET status = ?1, error_message = ?2,
                expires_on = COALESCE(?3, expires_on), modified_on = datetime('now')
             WHERE id = ?4",
            params![status, error_message, expires_on.map(|t| t.to_rfc3339()), id],
        )?;
        if rows == 0 {
            return Err(Error::not_found("certificate", id));
        }
        Ok(())
    }

    /// IDs of certificates that still need to be requested
    pub fn list_pending_certificate_ids(&self) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id FROM certificate
             WHERE status = 'ready' AND is_deleted = 0
               AND ((type IN ('http', 'dns') AND certificate_authority_id > 0)
                    OR type IN ('custom', 'mkcert'))
             ORDER BY id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Soft-delete a certificate
    pub fn delete_certificate(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE certificate SET is_deleted = 1, modified_on = datetime('now') WHERE id = ?1 AND is_deleted = 0",
            params![id],
        )?;
        Ok(rows > 0)
    }

    // ==================== Hosts ====================

    /// Insert or update a host
    ///
    /// Unless `skip_configuration` is set the host goes back to `ready` so the
    /// next configuration task picks it up fresh.
    pub fn save_host(&self, host: &mut Host, skip_configuration: bool) -> Result<()> {
        if host.domain_names.is_empty() {
            return Err(Error::Validation("Host requires at least one domain name".to_string()));
        }
        if !skip_configuration {
            host.status = ConfigStatus::Ready;
            host.error_message.clear();
        }

        let domain_names = serde_json::to_string(&host.domain_names)?;
        let conn = self.conn.lock();
        if host.id == 0 {
            conn.execute(
                "INSERT INTO host (user_id, type, nginx_template_id, listen_interface, domain_names,
                    upstream_id, certificate_id, ssl_forced, caching_enabled, block_exploits,
                    allow_websocket_upgrade, http2_support, hsts_enabled, hsts_subdomains, paths,
                    advanced_config, status, error_message, is_disabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                params![
                    host.user_id,
                    host.host_type,
                    host.nginx_template_id,
                    host.listen_interface,
                    domain_names,
                    host.upstream_id,
                    host.certificate_id,
                    host.ssl_forced,
                    host.caching_enabled,
                    host.block_exploits,
                    host.allow_websocket_upgrade,
                    host.http2_support,
                    host.hsts_enabled,
                    host.hsts_subdomains,
                    host.paths,
                    host.advanced_config,
                    host.status,
                    host.error_message,
                    host.is_disabled,
                ],
            )?;
            host.id = conn.last_insert_rowid();
        } else {
            let rows = conn.execute(
                "UPDATE host SET user_id = ?1, type = ?2, nginx_template_id = ?3, listen_interface = ?4,
                    domain_names = ?5, upstream_id = ?6, certificate_id = ?7, ssl_forced = ?8,
                    caching_enabled = ?9, block_exploits = ?10, allow_websocket_upgrade = ?11,
                    http2_support = ?12, hsts_enabled = ?13, hsts_subdomains = ?14, paths = ?15,
                    advanced_config = ?16, status = ?17, error_message = ?18, is_disabled = ?19,
                    modified_on = datetime('now')
                 WHERE id = ?20 AND is_deleted = 0",
                params![
                    host.user_id,
                    host.host_type,
                    host.nginx_template_id,
                    host.listen_interface,
                    domain_names,
                    host.upstream_id,
                    host.certificate_id,
                    host.ssl_forced,
                    host.caching_enabled,
                    host.block_exploits,
                    host.allow_websocket_upgrade,
                    host.http2_support,
                    host.hsts_enabled,
                    host.hsts_subdomains,
                    host.paths,
                    host.advanced_config,
                    host.status,
                    host.error_message,
                    host.is_disabled,
                    host.id,
                ],
            )?;
            if rows == 0 {
                return Err(Error::not_found("host", host.id));
            }
        }
        Ok(())
    }

    pub fn get_host(&self, id: i64) -> Result<Option<Host>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM host WHERE id = ?1 AND is_deleted = 0", HOST_COLUMNS);
        let host = conn.query_row(&sql, params![id], host_from_row).optional()?;
        Ok(host)
    }

    /// Load the certificate, template and upstream a host points at
    pub fn expand_host(&self, host: &mut Host) -> Result<()> {
        host.certificate = match host.certificate_id {
            0 => None,
            id => match self.get_certificate(id)? {
                Some(mut cert) => {
                    self.expand_certificate(&mut cert)?;
                    Some(cert)
                }
                None => None,
            },
        };
        host.nginx_template = match host.nginx_template_id {
            0 => None,
            id => self.get_nginx_template(id)?,
        };
        host.upstream = match host.upstream_id {
            0 => None,
            id => self.get_upstream(id)?,
        };
        Ok(())
    }

    pub fn update_host_status(&self, id: i64, status: ConfigStatus, error_message: &str) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE host SET status = ?1, error_message = ?2, modified_on = datetime('now') WHERE id = ?3",
            params![status, error_message, id],
        )?;
        if rows == 0 {
            return Err(Error::not_found("host", id));
        }
        Ok(())
    }

    pub fn list_host_ids_by_status(&self, status: ConfigStatus) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM host WHERE status = ?1 AND is_deleted = 0 ORDER BY id")?;
        let ids = stmt
            .query_map(params![status], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Soft-delete a host
    pub fn delete_host(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE host SET is_deleted = 1, modified_on = datetime('now') WHERE id = ?1 AND is_deleted = 0",
            params![id],
        )?;
        Ok(rows > 0)
    }

    // ==================== Upstreams ====================

    /// Insert or update an upstream and replace its server list
    pub fn save_upstream(&self, upstream: &mut Upstream, skip_configuration: bool) -> Result<()> {
        if upstream.servers.is_empty() {
            return Err(Error::Validation("Upstream requires at least one server".to_string()));
        }
        if !skip_configuration {
            upstream.status = ConfigStatus::Ready;
            upstream.error_message.clear();
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        if upstream.id == 0 {
            tx.execute(
                "INSERT INTO upstream (user_id, name, nginx_template_id, ip_hash, ntlm, keepalive,
                    keepalive_requests, keepalive_time, keepalive_timeout, advanced_config, status, error_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    upstream.user_id,
                    upstream.name,
                    upstream.nginx_template_id,
                    upstream.ip_hash,
                    upstream.ntlm,
                    upstream.keepalive,
                    upstream.keepalive_requests,
                    upstream.keepalive_time,
                    upstream.keepalive_timeout,
                    upstream.advanced_config,
                    upstream.status,
                    upstream.error_message,
                ],
            )?;
            upstream.id = tx.last_insert_rowid();
        } else {
            let rows = tx.execute(
                "UPDATE upstream SET user_id = ?1, name = ?2, nginx_template_id = ?3, ip_hash = ?4, ntlm = ?5,
                    keepalive = ?6, keepalive_requests = ?7, keepalive_time = ?8, keepalive_timeout = ?9,
                    advanced_config = ?10, status = ?11, error_message = ?12, modified_on = datetime('now')
                 WHERE id = ?13 AND is_deleted = 0",
                params![
                    upstream.user_id,
                    upstream.name,
                    upstream.nginx_template_id,
                    upstream.ip_hash,
                    upstream.ntlm,
                    upstream.keepalive,
                    upstream.keepalive_requests,
                    upstream.keepalive_time,
                    upstream.keepalive_timeout,
                    upstream.advanced_config,
                    upstream.status,
                    upstream.error_message,
                    upstream.id,
                ],
            )?;
            if rows == 0 {
                return Err(Error::not_found("upstream", upstream.id));
            }
            tx.execute("DELETE FROM upstream_server WHERE upstream_id = ?1", params![upstream.id])?;
        }

        for server in upstream.servers.iter_mut() {
            server.upstream_id = upstream.id;
            tx.execute(
                "INSERT INTO upstream_server (upstream_id, server, weight, max_conns, max_fails, fail_timeout, backup)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    server.upstream_id,
                    server.server,
                    server.weight,
                    server.max_conns,
                    server.max_fails,
                    server.fail_timeout,
                    server.backup,
                ],
            )?;
            server.id = tx.last_insert_rowid();
        }

        tx.commit()?;
        Ok(())
    }

    /// Get an upstream together with its servers
    pub fn get_upstream(&self, id: i64) -> Result<Option<Upstream>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {} FROM upstream WHERE id = ?1 AND is_deleted = 0", UPSTREAM_COLUMNS);
        let Some(mut upstream) = conn.query_row(&sql, params![id], upstream_from_row).optional()? else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT id, upstream_id, server, weight, max_conns, max_fails, fail_timeout, backup
             FROM upstream_server WHERE upstream_id = ?1 ORDER BY id",
        )?;
        upstream.servers = stmt
            .query_map(params![id], |row| {
                Ok(UpstreamServer {
                    id: row.get(0)?,
                    upstream_id: row.get(1)?,
                    server: row.get(2)?,
                    weight: row.get(3)?,
                    max_conns: row.get(4)?,
                    max_fails: row.get(5)?,
                    fail_timeout: row.get(6)?,
                    backup: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(Some(upstream))
    }

    pub fn expand_upstream(&self, upstream: &mut Upstream) -> Result<()> {
        upstream.nginx_template = match upstream.nginx_template_id {
            0 => None,
            id => self.get_nginx_template(id)?,
        };
        Ok(())
    }

    pub fn update_upstream_status(&self, id: i64, status: ConfigStatus, error_message: &str) -> Result<()> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE upstream SET status = ?1, error_message = ?2, modified_on = datetime('now') WHERE id = ?3",
            params![status, error_message, id],
        )?;
        if rows == 0 {
            return Err(Error::not_found("upstream", id));
        }
        Ok(())
    }

    pub fn list_upstream_ids_by_status(&self, status: ConfigStatus) -> Result<Vec<i64>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT id FROM upstream WHERE status = ?1 AND is_deleted = 0 ORDER BY id")?;
        let ids = stmt
            .query_map(params![status], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Soft-delete an upstream
    pub fn delete_upstream(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute(
            "UPDATE upstream SET is_deleted = 1, modified_on = datetime('now') WHERE id = ?1 AND is_deleted = 0",
            params![id],
        )?;
        Ok(rows > 0)
    }
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        DateTime::parse_from_rfc3339(&t)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn certificate_from_row(row: &Row<'_>) -> rusqlite::Result<Certificate> {
    Ok(Certificate {
        id: row.get(0)?,
        user_id: row.get(1)?,
        cert_type: row.get(2)?,
        certificate_authority_id: row.get(3)?,
        dns_provider_id: row.get(4)?,
        name: row.get(5)?,
        domain_names: json_column(row, 6)?,
        expires_on: timestamp_column(row, 7)?,
        status: row.get(8)?,
        error_message: row.get(9)?,
        meta: json_column(row, 10)?,
        is_ecc: row.get(11)?,
        is_deleted: row.get(12)?,
        certificate_authority: None,
        dns_provider: None,
    })
}

fn host_from_row(row: &Row<'_>) -> rusqlite::Result<Host> {
    Ok(Host {
        id: row.get(0)?,
        user_id: row.get(1)?,
        host_type: row.get(2)?,
        nginx_template_id: row.get(3)?,
        listen_interface: row.get(4)?,
        domain_names: json_column(row, 5)?,
        upstream_id: row.get(6)?,
        certificate_id: row.get(7)?,
        ssl_forced: row.get(8)?,
        caching_enabled: row.get(9)?,
        block_exploits: row.get(10)?,
        allow_websocket_upgrade: row.get(11)?,
        http2_support: row.get(12)?,
        hsts_enabled: row.get(13)?,
        hsts_subdomains: row.get(14)?,
        paths: row.get(15)?,
        advanced_config: row.get(16)?,
        status: row.get(17)?,
        error_message: row.get(18)?,
        is_disabled: row.get(19)?,
        is_deleted: row.get(20)?,
        certificate: None,
        nginx_template: None,
        upstream: None,
    })
}

fn upstream_from_row(row: &Row<'_>) -> rusqlite::Result<Upstream> {
    Ok(Upstream {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        nginx_template_id: row.get(3)?,
        ip_hash: row.get(4)?,
        ntlm: row.get(5)?,
        keepalive: row.get(6)?,
        keepalive_requests: row.get(7)?,
        keepalive_time: row.get(8)?,
        keepalive_timeout: row.get(9)?,
        advanced_config: row.get(10)?,
        status: row.get(11)?,
        error_message: row.get(12)?,
        is_deleted: row.get(13)?,
        servers: Vec::new(),
        nginx_template: None,
    })
}
