use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const ENVELOPE_PREFIX: &str = "enc:v1:";
const KEY_FILE: &str = ".key";

/// OAuth credential material for one account. Everything here is secret
/// apart from `scopes` and `expiry`; none of it may ever be logged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub expiry: Option<DateTime<Utc>>,
}

impl Credential {
    /// Expired or within a minute of expiring. Unknown expiry counts as
    /// expired so the token gets refreshed before first use.
    pub fn is_expired(&self) -> bool {
        match self.expiry {
            Some(expiry) => expiry - chrono::Duration::seconds(60) <= Utc::now(),
            None => true,
        }
    }
}

#[derive(Debug)]
pub enum VaultError {
    /// No credential stored for the account.
    Missing(String),
    /// The stored file exists but cannot be decrypted or parsed.
    Corrupt(String),
    Io(std::io::Error),
}

impl std::fmt::Display for VaultError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VaultError::Missing(account) => {
                write!(f, "no stored credentials for {}", account)
            }
            VaultError::Corrupt(e) => write!(f, "credential file is corrupt: {}", e),
            VaultError::Io(e) => write!(f, "vault I/O error: {}", e),
        }
    }
}

impl From<std::io::Error> for VaultError {
    fn from(e: std::io::Error) -> Self {
        VaultError::Io(e)
    }
}

/// Encrypted on-disk credential store. One key file per vault directory,
/// one `<email>.cred` file per account, all owner-only.
pub struct Vault {
    dir: PathBuf,
    cipher: ChaCha20Poly1305,
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

impl Vault {
    /// Open a vault directory, creating it and its key on first use.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, VaultError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        restrict_permissions(&dir, 0o700)?;

        let key_path = dir.join(KEY_FILE);
        let key_bytes = if key_path.exists() {
            let bytes = fs::read(&key_path)?;
            if bytes.len() != 32 {
                return Err(VaultError::Corrupt(format!(
                    "key file {} has wrong length",
                    key_path.display()
                )));
            }
            bytes
        } else {
            log_info!("[VAULT] Generating new vault key: {}", key_path.display());
            let key = ChaCha20Poly1305::generate_key(&mut OsRng);
            write_atomic(&key_path, key.as_slice())?;
            key.to_vec()
        };

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
        Ok(Vault { dir, cipher })
    }

    fn credential_path(&self, account: &str) -> PathBuf {
        self.dir.join(format!("{}.cred", account))
    }

    pub fn store(&self, account: &str, credential: &Credential) -> Result<(), VaultError> {
        let plaintext = serde_json::to_vec(credential)
            .map_err(|e| VaultError::Corrupt(format!("failed to serialize credential: {}", e)))?;

        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| VaultError::Corrupt("encryption failed".to_string()))?;

        let envelope = format!(
            "{}{}:{}",
            ENVELOPE_PREFIX,
            URL_SAFE_NO_PAD.encode(nonce),
            URL_SAFE_NO_PAD.encode(&ciphertext)
        );

        let path = self.credential_path(account);
        write_atomic(&path, envelope.as_bytes())?;
        log_debug!("[VAULT] Stored credentials for {}", account);
        Ok(())
    }

    pub fn load(&self, account: &str) -> Result<Credential, VaultError> {
        let path = self.credential_path(account);
        let envelope = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::Missing(account.to_string()));
            }
            Err(e) => return Err(VaultError::Io(e)),
        };

        let rest = envelope
            .trim_end()
            .strip_prefix(ENVELOPE_PREFIX)
            .ok_or_else(|| {
                VaultError::Corrupt(format!("{} has no envelope header", path.display()))
            })?;
        let (nonce_b64, ct_b64) = rest.split_once(':').ok_or_else(|| {
            VaultError::Corrupt(format!("{} envelope is malformed", path.display()))
        })?;

        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(nonce_b64)
            .map_err(|e| VaultError::Corrupt(format!("bad nonce encoding: {}", e)))?;
        if nonce_bytes.len() != 12 {
            return Err(VaultError::Corrupt("bad nonce length".to_string()));
        }
        let ciphertext = URL_SAFE_NO_PAD
            .decode(ct_b64)
            .map_err(|e| VaultError::Corrupt(format!("bad ciphertext encoding: {}", e)))?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_slice())
            .map_err(|_| {
                VaultError::Corrupt(format!(
                    "decryption failed for {} (wrong key or tampered file)",
                    path.display()
                ))
            })?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| VaultError::Corrupt(format!("failed to parse credential: {}", e)))
    }
}

/// Open for writing with owner-only permissions from the moment the file
/// exists; secret bytes must never pass through a world-readable window.
#[cfg(unix)]
fn create_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

/// Write owner-only via a temp file in the same directory, then rename.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), VaultError> {
    use std::io::Write as _;

    let dir = path.parent().ok_or_else(|| {
        VaultError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "path has no parent directory",
        ))
    })?;
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "vault".to_string())
    ));
    let mut file = create_private(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    // The open mode is masked by umask; pin the exact mode before the
    // rename makes the file visible under its final name.
    restrict_permissions(&tmp, 0o600)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
