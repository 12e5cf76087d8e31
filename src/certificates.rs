//! Certificate reconciler
//!
//! Drives a certificate from `ready` to `provided` or `failed`. `ready`
//! rows are found by a sweep at startup and then on a timer; each one
//! becomes a `RequestCertificate` task on the shared queue.
//!
//! A row is marked `requesting` before anything external runs, so a crash
//! mid-request leaves it in `requesting` instead of re-issuing forever.
//! Nothing here retries a `failed` row.

use crate::acme::{read_certificate_expiry, AcmeError, CertificateIssuer};
use crate::db::Database;
use crate::error::Error;
use crate::events::{Change, ChangeNotifier};
use crate::jobs::Job;
use crate::models::{Certificate, CertificatePaths, CertificateStatus, CertificateType};
use crate::queue::{Task, TaskQueue};
use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct CertificateReconciler {
    db: Arc<Database>,
    issuer: Arc<dyn CertificateIssuer>,
    events: ChangeNotifier,
    paths: CertificatePaths,
}

impl CertificateReconciler {
    pub fn new(
        db: Arc<Database>,
        issuer: Arc<dyn CertificateIssuer>,
        events: ChangeNotifier,
        paths: CertificatePaths,
    ) -> Self {
        Self {
            db,
            issuer,
            events,
            paths,
        }
    }

    /// Run one certificate through issuance and record the outcome
    pub async fn request(&self, id: i64) -> anyhow::Result<()> {
        let mut cert = self
            .db
            .get_certificate(id)?
            .ok_or_else(|| Error::not_found("certificate", id))?;
        self.db.expand_certificate(&mut cert)?;

        self.db
            .update_certificate_status(id, CertificateStatus::Requesting, "", None)
            .with_context(|| format!("Failed to mark certificate #{} as requesting", id))?;
        self.events.send_change(Change::Certificates);
        info!(certificate_id = id, cert_type = %cert.cert_type, domains = ?cert.domain_names, "Requesting certificate");

        let (status, error_message, expires_on) = match self.issue(&cert).await {
            Ok(()) => {
                let expires_on = read_certificate_expiry(&cert.fullchain_file(&self.paths))
                    .await
                    .unwrap_or_else(Utc::now);
                info!(certificate_id = id, expires_on = %expires_on, "Certificate provided");
                (CertificateStatus::Provided, String::new(), Some(expires_on))
            }
            Err(e) => {
                let message = e.diagnostic();
                warn!(certificate_id = id, error = %message, "Certificate request failed");
                (CertificateStatus::Failed, message, None)
            }
        };

        self.db
            .update_certificate_status(id, status, &error_message, expires_on)
            .with_context(|| format!("Failed to persist status of certificate #{}", id))?;
        self.events.send_change(Change::Certificates);

        if status == CertificateStatus::Failed {
            anyhow::bail!("certificate #{}: {}", id, error_message);
        }
        Ok(())
    }

    async fn issue(&self, cert: &Certificate) -> Result<(), AcmeError> {
        match cert.cert_type {
            CertificateType::Custom => {
                debug!(certificate_id = cert.id, "Custom certificate, nothing to issue");
                Ok(())
            }
            CertificateType::Mkcert => {
                debug!(certificate_id = cert.id, "mkcert certificate, nothing to issue");
                Ok(())
            }
            CertificateType::Http | CertificateType::Dns => {
                let folder = cert.folder(&self.paths);
                tokio::fs::create_dir_all(&folder)
                    .await
                    .map_err(|source| AcmeError::Folder {
                        path: folder.clone(),
                        source,
                    })?;

                self.issuer
                    .issue(cert, &cert.fullchain_file(&self.paths), &cert.key_file(&self.paths))
                    .await?;
                Ok(())
            }
        }
    }

    /// Task that runs [`request`](Self::request) for one certificate
    pub fn request_task(self: &Arc<Self>, id: i64) -> Task {
        let reconciler = Arc::clone(self);
        Task::new(Job::RequestCertificate(id).to_string(), move || async move {
            reconciler.request(id).await
        })
    }

    /// Enqueue a request for every certificate still waiting in `ready`
    ///
    /// Rows already queued by an earlier sweep but not yet picked up are
    /// enqueued again.
    pub async fn add_pending_jobs(self: &Arc<Self>, queue: &TaskQueue) -> anyhow::Result<usize> {
        let ids = self
            .db
            .list_pending_certificate_ids()
            .context("Failed to list pending certificates")?;

        for id in &ids {
            queue.add_job(self.request_task(*id)).await?;
        }

        if !ids.is_empty() {
            debug!(count = ids.len(), "Enqueued pending certificate requests");
        }
        Ok(ids.len())
    }

    /// Re-run the pending sweep every `interval` until shutdown
    ///
    /// Shutdown also interrupts a sweep blocked on a full queue; ids not yet
    /// enqueued stay `ready` for the next start.
    pub async fn run(self: Arc<Self>, queue: Arc<TaskQueue>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Certificate sweep started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            tokio::select! {
                result = self.add_pending_jobs(&queue) => {
                    if let Err(e) = result {
                        warn!(error = %format!("{:#}", e), "Certificate sweep failed");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Certificate sweep stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CertificateAuthority, DnsProvider};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::path::{Path, PathBuf};

    /// Records every call, and the stored status seen mid-issuance, then
    /// answers with a canned result
    struct FakeIssuer {
        db: Arc<Database>,
        calls: Mutex<Vec<(i64, PathBuf)>>,
        seen_status: Mutex<Vec<CertificateStatus>>,
        failure: Mutex<Option<String>>,
    }

    impl FakeIssuer {
        fn new(db: Arc<Database>) -> Self {
            Self {
                db,
                calls: Mutex::new(Vec::new()),
                seen_status: Mutex::new(Vec::new()),
                failure: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl CertificateIssuer for FakeIssuer {
        async fn issue(&self, cert: &Certificate, fullchain_file: &Path, _key_file: &Path) -> Result<String, AcmeError> {
            self.calls.lock().push((cert.id, fullchain_file.to_path_buf()));
            let stored = self.db.get_certificate(cert.id).unwrap().unwrap();
            self.seen_status.lock().push(stored.status);
            match self.failure.lock().clone() {
                Some(output) => Err(AcmeError::Process(crate::error::ExternalProcessError::Failed {
                    command: "acme.sh".to_string(),
                    args: vec!["--issue".to_string()],
                    code: Some(1),
                    output,
                })),
                None => Ok(String::new()),
            }
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        db: Arc<Database>,
        issuer: Arc<FakeIssuer>,
        reconciler: Arc<CertificateReconciler>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let issuer = Arc::new(FakeIssuer::new(db.clone()));
        let paths = CertificatePaths {
            data_dir: dir.path().join("data"),
            cert_home: dir.path().join("certs"),
        };
        let reconciler = Arc::new(CertificateReconciler::new(
            db.clone(),
            issuer.clone(),
            ChangeNotifier::default(),
            paths,
        ));
        Fixture {
            dir,
            db,
            issuer,
            reconciler,
        }
    }

    fn http_certificate(db: &Database) -> Certificate {
        let mut ca = CertificateAuthority {
            name: "Let's Encrypt".to_string(),
            acmesh_server: "https://acme-v02.api.letsencrypt.org/directory".to_string(),
            ..Default::default()
        };
        db.create_certificate_authority(&mut ca).unwrap();

        let mut cert = Certificate::new(CertificateType::Http, "web", &["example.com"]);
        cert.certificate_authority_id = ca.id;
        db.save_certificate(&mut cert).unwrap();
        cert
    }

    #[tokio::test]
    async fn test_custom_certificate_provided_without_issuer() {
        let f = fixture();
        let mut cert = Certificate::new(CertificateType::Custom, "custom", &[]);
        f.db.save_certificate(&mut cert).unwrap();

        f.reconciler.request(cert.id).await.unwrap();

        let stored = f.db.get_certificate(cert.id).unwrap().unwrap();
        assert_eq!(stored.status, CertificateStatus::Provided);
        assert!(stored.expires_on.is_some());
        assert!(f.issuer.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_mkcert_short_circuits() {
        let f = fixture();
        let mut cert = Certificate::new(CertificateType::Mkcert, "local", &["local.test"]);
        f.db.save_certificate(&mut cert).unwrap();

        f.reconciler.request(cert.id).await.unwrap();

        assert_eq!(
            f.db.get_certificate(cert.id).unwrap().unwrap().status,
            CertificateStatus::Provided
        );
        assert!(f.issuer.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_http_certificate_issued() {
        let f = fixture();
        let cert = http_certificate(&f.db);

        f.reconciler.request(cert.id).await.unwrap();

        let calls = f.issuer.calls.lock().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(*f.issuer.seen_status.lock(), vec![CertificateStatus::Requesting]);
        let expected_folder = f.dir.path().join("certs").join(format!("npm-{}", cert.id));
        assert_eq!(calls[0].1, expected_folder.join("fullchain.pem"));
        assert!(expected_folder.is_dir());

        let stored = f.db.get_certificate(cert.id).unwrap().unwrap();
        assert_eq!(stored.status, CertificateStatus::Provided);
        assert_eq!(stored.error_message, "");
        assert!(stored.expires_on.is_some());
    }

    #[tokio::test]
    async fn test_expiry_read_from_issued_chain() {
        let f = fixture();
        let cert = http_certificate(&f.db);

        let folder = f.dir.path().join("certs").join(format!("npm-{}", cert.id));
        std::fs::create_dir_all(&folder).unwrap();
        let rcgen::CertifiedKey { cert: issued, .. } =
            rcgen::generate_simple_self_signed(vec!["example.com".to_string()]).unwrap();
        std::fs::write(folder.join("fullchain.pem"), issued.pem()).unwrap();

        f.reconciler.request(cert.id).await.unwrap();

        let stored = f.db.get_certificate(cert.id).unwrap().unwrap();
        let expected = read_certificate_expiry(&folder.join("fullchain.pem")).await.unwrap();
        assert_eq!(stored.expires_on, Some(expected));
    }

    #[tokio::test]
    async fn test_failed_issuance_recorded() {
        let f = fixture();
        let cert = http_certificate(&f.db);
        *f.issuer.failure.lock() = Some("Verify error: Invalid response from example.com\n".to_string());

        let err = f.reconciler.request(cert.id).await.unwrap_err();
        assert!(err.to_string().contains("Verify error"));
        assert_eq!(*f.issuer.seen_status.lock(), vec![CertificateStatus::Requesting]);

        let stored = f.db.get_certificate(cert.id).unwrap().unwrap();
        assert_eq!(stored.status, CertificateStatus::Failed);
        assert_eq!(stored.error_message, "Verify error: Invalid response from example.com");
        assert!(stored.expires_on.is_none());
    }

    #[tokio::test]
    async fn test_dns_without_resolvable_provider_fails() {
        let f = fixture();
        let mut ca = CertificateAuthority {
            name: "CA".to_string(),
            acmesh_server: "https://ca.example/directory".to_string(),
            ..Default::default()
        };
        f.db.create_certificate_authority(&mut ca).unwrap();

        // Provider id points at nothing, so expansion leaves it unresolved
        let mut cert = Certificate::new(CertificateType::Dns, "dns", &["*.example.com"]);
        cert.certificate_authority_id = ca.id;
        cert.dns_provider_id = 99;
        f.db.save_certificate(&mut cert).unwrap();

        assert!(f.reconciler.request(cert.id).await.is_err());

        let stored = f.db.get_certificate(cert.id).unwrap().unwrap();
        assert_eq!(stored.status, CertificateStatus::Failed);
        assert!(!stored.error_message.is_empty());
    }

    #[tokio::test]
    async fn test_dns_provider_expanded_for_issuer() {
        let f = fixture();
        let cert = {
            let mut ca = CertificateAuthority {
                name: "CA".to_string(),
                acmesh_server: "https://ca.example/directory".to_string(),
                ..Default::default()
            };
            f.db.create_certificate_authority(&mut ca).unwrap();
            let mut provider = DnsProvider {
                name: "Cloudflare".to_string(),
                acmesh_name: "dns_cf".to_string(),
                ..Default::default()
            };
            f.db.create_dns_provider(&mut provider).unwrap();

            let mut cert = Certificate::new(CertificateType::Dns, "dns", &["*.example.com"]);
            cert.certificate_authority_id = ca.id;
            cert.dns_provider_id = provider.id;
            f.db.save_certificate(&mut cert).unwrap();
            cert
        };

        f.reconciler.request(cert.id).await.unwrap();
        assert_eq!(f.issuer.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_certificate() {
        let f = fixture();
        let err = f.reconciler.request(31337).await.unwrap_err();
        assert_eq!(err.to_string(), "certificate #31337 not found");
    }

    #[tokio::test]
    async fn test_add_pending_jobs_enqueues_ready_rows() {
        let f = fixture();
        let http = http_certificate(&f.db);
        let mut custom = Certificate::new(CertificateType::Custom, "custom", &[]);
        f.db.save_certificate(&mut custom).unwrap();
        let mut done = Certificate::new(CertificateType::Mkcert, "done", &["done.test"]);
        done.status = CertificateStatus::Provided;
        f.db.save_certificate(&mut done).unwrap();

        let queue = TaskQueue::new(10);
        assert!(f.reconciler.add_pending_jobs(&queue).await.is_err(), "queue not started");

        queue.start().unwrap();
        let count = f.reconciler.add_pending_jobs(&queue).await.unwrap();
        assert_eq!(count, 2);
        queue.add_job(Task::new("barrier", || async { Ok(()) })).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let provided = [http.id, custom.id].iter().all(|id| {
                f.db.get_certificate(*id).unwrap().unwrap().status == CertificateStatus::Provided
            });
            if provided {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "certificates were not processed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        queue.shutdown().await.unwrap();

        assert!(f.db.list_pending_certificate_ids().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_enqueues_and_stops_on_shutdown() {
        let f = fixture();
        let mut custom = Certificate::new(CertificateType::Custom, "custom", &[]);
        f.db.save_certificate(&mut custom).unwrap();

        let queue = Arc::new(TaskQueue::new(10));
        queue.start().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = tokio::spawn(f.reconciler.clone().run(
            queue.clone(),
            Duration::from_millis(20),
            shutdown_rx,
        ));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while f.db.get_certificate(custom.id).unwrap().unwrap().status != CertificateStatus::Provided {
            assert!(tokio::time::Instant::now() < deadline, "sweep never picked up the certificate");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), sweeper)
            .await
            .expect("sweep did not stop")
            .unwrap();
        queue.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_stops_while_blocked_on_full_queue() {
        let f = fixture();
        for name in ["a", "b", "c"] {
            let mut cert = Certificate::new(CertificateType::Custom, name, &[]);
            f.db.save_certificate(&mut cert).unwrap();
        }

        let queue = Arc::new(TaskQueue::new(1));
        queue.start().unwrap();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        queue
            .add_job(Task::new("blocker", move || async move {
                let _ = started_tx.send(());
                let _ = release_rx.await;
                Ok(())
            }))
            .await
            .unwrap();
        started_rx.await.unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = tokio::spawn(f.reconciler.clone().run(
            queue.clone(),
            Duration::from_millis(10),
            shutdown_rx,
        ));

        // Worker is held and the single slot fills, so the sweep blocks
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!sweeper.is_finished());

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_millis(500), sweeper)
            .await
            .expect("sweep kept waiting for queue space after shutdown")
            .unwrap();

        let _ = release_tx.send(());
        queue.shutdown().await.unwrap();
    }
}
