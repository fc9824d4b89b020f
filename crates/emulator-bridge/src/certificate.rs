//! Certificate Installer
//!
//! Installs CA certificates into the device's system trust store as
//! `<subject hash>.0`, the name Android looks certificates up by.

use std::path::{Path, PathBuf};
use std::time::Duration;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tempfile::TempDir;
use tracing::{debug, info};

use droid_sys_core::{BridgeError, Result};

use crate::adb::{describe, AdbClient, ExecOptions};

/// System trust store on the device
pub const CA_CERTS_DIR: &str = "/system/etc/security/cacerts";

const PEM_MARKER: &[u8] = b"-----BEGIN CERTIFICATE-----";
const REMOUNT_ATTEMPTS: u32 = 5;
const REMOUNT_INTERVAL: Duration = Duration::from_millis(2000);

/// Certificate content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateData {
    /// Raw PEM or DER bytes
    Bytes(Vec<u8>),
    /// Base64 text of the raw bytes
    Base64(String),
}

impl CertificateData {
    pub fn decode(&self) -> Result<Vec<u8>> {
        match self {
            CertificateData::Bytes(bytes) => Ok(bytes.clone()),
            CertificateData::Base64(text) => {
                let compact: String = text.split_whitespace().collect();
                BASE64
                    .decode(compact)
                    .map_err(|e| BridgeError::Certificate(format!("Invalid base64 content: {}", e)))
            }
        }
    }
}

impl From<Vec<u8>> for CertificateData {
    fn from(bytes: Vec<u8>) -> Self {
        CertificateData::Bytes(bytes)
    }
}

impl From<&[u8]> for CertificateData {
    fn from(bytes: &[u8]) -> Self {
        CertificateData::Bytes(bytes.to_vec())
    }
}

fn is_pem(bytes: &[u8]) -> bool {
    bytes.windows(PEM_MARKER.len()).any(|w| w == PEM_MARKER)
}

/// Certificate written to a temporary directory, removed on drop
struct StagedCertificate {
    dir: TempDir,
    source: PathBuf,
    pem: bool,
}

impl StagedCertificate {
    async fn write(cert: &CertificateData) -> Result<Self> {
        let bytes = cert.decode()?;
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("source.cer");
        tokio::fs::write(&source, &bytes).await?;
        Ok(Self {
            dir,
            source,
            pem: is_pem(&bytes),
        })
    }

    /// `openssl x509` arguments reading this certificate
    fn x509_args(&self, extra: &[&str]) -> Vec<String> {
        let mut args = vec!["x509".to_string()];
        args.extend(extra.iter().map(|a| a.to_string()));
        if !self.pem {
            args.push("-inform".to_string());
            args.push("DER".to_string());
        }
        args.push("-in".to_string());
        args.push(self.source.to_string_lossy().to_string());
        args
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

fn into_certificate_error(err: BridgeError) -> BridgeError {
    match err {
        BridgeError::Certificate(_) => err,
        other => BridgeError::Certificate(other.to_string()),
    }
}

impl AdbClient {
    async fn openssl(&self, args: Vec<String>) -> Result<String> {
        let openssl = self.locator.resolve("openssl").await?;
        let command = describe(&openssl, &args);
        let output = self
            .runner
            .run(&openssl, &args, Some(self.config.exec_timeout()))
            .await
            .map_err(|source| BridgeError::Spawn {
                command: command.clone(),
                source,
            })?;
        if !output.success() {
            return Err(BridgeError::Certificate(format!(
                "`{}` failed: {}. {}",
                command,
                output.failure_message(),
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }

    async fn staged_hash(&self, staged: &StagedCertificate) -> Result<String> {
        let hash = self
            .openssl(staged.x509_args(&["-noout", "-hash"]))
            .await?
            .trim()
            .to_string();
        if hash.is_empty() {
            return Err(BridgeError::Certificate("Empty certificate hash".into()));
        }
        debug!("Got certificate hash: {}", hash);
        Ok(hash)
    }

    /// Subject hash of a certificate
    pub async fn certificate_hash(&self, cert: &CertificateData) -> Result<String> {
        let staged = StagedCertificate::write(cert).await?;
        self.staged_hash(&staged).await
    }

    async fn remount(&self) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.execute(&["remount"], &ExecOptions::default()).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < REMOUNT_ATTEMPTS => {
                    debug!("Remount attempt {}/{} failed: {}", attempt, REMOUNT_ATTEMPTS, e);
                    attempt += 1;
                    tokio::time::sleep(REMOUNT_INTERVAL).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn install_staged(&self, staged: &StagedCertificate) -> Result<()> {
        let hash = self.staged_hash(staged).await?;

        debug!("Preparing certificate content");
        let mut content = self.openssl(staged.x509_args(&[])).await?;
        content.push_str(&self.openssl(staged.x509_args(&["-text", "-fingerprint", "-noout"])).await?);

        let file_name = format!("{}.0", hash);
        let destination = staged.path().join(&file_name);
        tokio::fs::write(&destination, content).await?;

        debug!("Remounting /system in rw mode");
        self.remount().await?;
        let remote = format!("{}/{}", CA_CERTS_DIR, file_name);
        debug!("Uploading the generated certificate from '{}' to '{}'", destination.display(), remote);
        self.push(&destination, &remote).await?;
        debug!("Remounting /system to confirm changes");
        self.remount().await?;
        Ok(())
    }

    /// Install `cert` into the system trust store.
    ///
    /// The device needs a writable system partition, which usually means a
    /// rooted daemon.
    pub async fn install_certificate(&self, cert: &CertificateData) -> Result<()> {
        let staged = StagedCertificate::write(cert).await.map_err(into_certificate_error)?;
        self.install_staged(&staged).await.map_err(into_certificate_error)?;
        info!("Installed certificate into {}", CA_CERTS_DIR);
        Ok(())
    }

    /// Whether `cert` is already in the system trust store
    pub async fn is_certificate_installed(&self, cert: &CertificateData) -> Result<bool> {
        let hash = self.certificate_hash(cert).await?;
        let remote = format!("{}/{}.0", CA_CERTS_DIR, hash);
        debug!("Checking if the certificate is already installed at '{}'", remote);
        self.file_exists(&remote).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessOutput;
    use crate::testing::{client_with, FakeConsole, FakeRunner};
    use droid_sys_core::BridgeConfig;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIBszCCAVmgAwIBAgIU\n-----END CERTIFICATE-----\n";
    const HASH: &str = "9a5ba575";

    /// Device trust store plus a local `openssl`
    fn device(files: Arc<Mutex<HashMap<String, String>>>, staged: Arc<Mutex<Vec<PathBuf>>>) -> Arc<FakeRunner> {
        let remounts = AtomicUsize::new(0);
        FakeRunner::new(move |call| {
            if call.program_name() == "openssl" {
                return if call.args.contains(&"-hash".to_string()) {
                    ProcessOutput::ok(format!("{}\n", HASH))
                } else if call.args.contains(&"-text".to_string()) {
                    ProcessOutput::ok("SHA1 Fingerprint=AA:BB\n")
                } else {
                    ProcessOutput::ok(PEM)
                };
            }
            let command = call.command();
            match command.first().map(String::as_str) {
                Some("remount") if remounts.fetch_add(1, Ordering::SeqCst) == 0 => {
                    ProcessOutput::failed(1, "remount failed: Device or resource busy")
                }
                Some("remount") => ProcessOutput::ok("remount succeeded"),
                Some("push") => {
                    let local = PathBuf::from(&command[1]);
                    let content = std::fs::read_to_string(&local).unwrap_or_default();
                    staged.lock().push(local);
                    files.lock().insert(command[2].clone(), content);
                    ProcessOutput::ok("1 file pushed")
                }
                Some("shell") if files.lock().contains_key(&command[2]) => {
                    ProcessOutput::ok(command[2].clone())
                }
                Some("shell") => ProcessOutput::failed(1, format!("ls: {}: No such file or directory", command[2])),
                _ => ProcessOutput::ok(""),
            }
        })
    }

    #[test]
    fn test_decode_base64() {
        let cert = CertificateData::Base64(BASE64.encode(PEM));
        assert_eq!(cert.decode().unwrap(), PEM.as_bytes());
        assert!(CertificateData::Base64("not base64!".into()).decode().is_err());
        assert!(is_pem(PEM.as_bytes()));
        assert!(!is_pem(&[0x30, 0x82, 0x01, 0xb3]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_install_round_trip() {
        let files = Arc::new(Mutex::new(HashMap::new()));
        let staged = Arc::new(Mutex::new(Vec::new()));
        let runner = device(files.clone(), staged.clone());
        let client = client_with(BridgeConfig::default(), runner.clone(), FakeConsole::new()).await;
        let cert = CertificateData::Base64(BASE64.encode(PEM));

        assert!(!client.is_certificate_installed(&cert).await.unwrap());
        client.install_certificate(&cert).await.unwrap();
        assert!(client.is_certificate_installed(&cert).await.unwrap());

        let remote = format!("{}/{}.0", CA_CERTS_DIR, HASH);
        let content = files.lock().get(&remote).cloned().unwrap();
        assert!(content.starts_with(PEM));
        assert!(content.ends_with("SHA1 Fingerprint=AA:BB\n"));

        assert_eq!(runner.count(|c| c.is("remount")), 3);
        assert!(staged.lock().iter().all(|p| !p.exists()));
    }

    #[tokio::test]
    async fn test_der_input_is_flagged() {
        let files = Arc::new(Mutex::new(HashMap::new()));
        let runner = device(files, Arc::new(Mutex::new(Vec::new())));
        let client = client_with(BridgeConfig::default(), runner.clone(), FakeConsole::new()).await;

        let hash = client
            .certificate_hash(&CertificateData::Bytes(vec![0x30, 0x82, 0x01, 0xb3]))
            .await
            .unwrap();
        assert_eq!(hash, HASH);
        let call = runner.calls().pop().unwrap();
        assert_eq!(&call.args[..5], &["x509", "-noout", "-hash", "-inform", "DER"]);
    }

    #[tokio::test]
    async fn test_failures_are_aggregated() {
        let runner = FakeRunner::new(|call| {
            if call.program_name() == "openssl" {
                ProcessOutput::failed(1, "unable to load certificate")
            } else {
                ProcessOutput::ok("")
            }
        });
        let client = client_with(BridgeConfig::default(), runner.clone(), FakeConsole::new()).await;

        let err = client
            .install_certificate(&CertificateData::Bytes(b"garbage".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Certificate(_)));
        assert!(err.to_string().contains("unable to load certificate"));
        assert!(err.to_string().contains("root permissions"));

        let call = runner.calls().pop().unwrap();
        let source = call
            .args
            .iter()
            .position(|a| a == "-in")
            .map(|idx| PathBuf::from(&call.args[idx + 1]))
            .unwrap();
        assert!(!source.exists());
        assert!(!source.parent().unwrap().exists());
    }
}
