//! Credential Store (CS) — §4.1.
//!
//! Persists the recognition-service API key confidentially at rest,
//! derives its encryption key from a device-local fingerprint, and backs
//! storage through the abstract [`KvStore`] surface. Grounded in the
//! teacher's `commands/keychain.rs` (thin wrapper over one secret store)
//! and `commands/ai_proxy.rs` (reqwest client construction and timeout/
//! status-code error mapping), enriched with the AES-256-GCM/PBKDF2
//! pattern used throughout the TrustEdge Labs example pack
//! (`backends/universal_keyring.rs`).

use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::{CredentialError, CredentialResult};
use crate::host::KvStore;

const SALT_LEN: usize = 16;
const IV_LEN: usize = 12;
const PBKDF2_ITERATIONS: u32 = 100_000;

const KEY_ENCRYPTED: &str = "api_key_encrypted";
const KEY_VERIFIED_AT: &str = "api_key_verified_at";
const KEY_SCOPES: &str = "api_key_scopes";
const KEY_PROJECT_UUID: &str = "project_uuid";
const KEY_RECOGNITION_MODE: &str = "recognition_mode";

/// A device-local, stable, non-secret attribute set used as PBKDF2 input
/// (§4.1 "fingerprint string", §9 "Device-fingerprint drift").
///
/// Every field must return an identical value across every execution
/// context the core runs in; callers that cannot observe a real value in
/// some context (e.g. a worker without `navigator`-equivalent access)
/// must supply the same sentinel literal there as everywhere else, never
/// omit the field.
#[derive(Debug, Clone)]
pub struct DeviceFingerprint {
    pub user_agent_token: String,
    pub language: String,
    pub timezone_offset_min: i32,
    pub hardware_concurrency: u32,
    pub platform: String,
}

impl DeviceFingerprint {
    fn to_bytes(&self) -> Vec<u8> {
        format!(
            "{}|{}|{}|{}|{}",
            self.user_agent_token,
            self.language,
            self.timezone_offset_min,
            self.hardware_concurrency,
            self.platform
        )
        .into_bytes()
    }
}

/// Scopes and identity returned by a successful `verify()` call (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOutcome {
    pub scopes: Vec<String>,
    pub project_id: String,
    pub expires_at: Option<i64>,
}

/// Bounded, non-secret projection of stored-credential state (§4.1 "info").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialInfo {
    pub present: bool,
    pub scopes: Vec<String>,
    pub verified_at: Option<i64>,
    pub project_id: Option<String>,
}

/// `salt || iv || ciphertext||tag`, base64-encoded (§3 EncryptedBlob, §4.1).
struct EncryptedBlob {
    salt: [u8; SALT_LEN],
    iv: [u8; IV_LEN],
    ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    fn encode(&self) -> String {
        let mut buf = Vec::with_capacity(SALT_LEN + IV_LEN + self.ciphertext.len());
        buf.extend_from_slice(&self.salt);
        buf.extend_from_slice(&self.iv);
        buf.extend_from_slice(&self.ciphertext);
        BASE64.encode(buf)
    }

    fn decode(s: &str) -> CredentialResult<Self> {
        let buf = BASE64
            .decode(s)
            .map_err(|_| CredentialError::DecryptionFailed)?;
        if buf.len() < SALT_LEN + IV_LEN {
            return Err(CredentialError::DecryptionFailed);
        }
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        salt.copy_from_slice(&buf[..SALT_LEN]);
        iv.copy_from_slice(&buf[SALT_LEN..SALT_LEN + IV_LEN]);
        let ciphertext = buf[SALT_LEN + IV_LEN..].to_vec();
        Ok(Self {
            salt,
            iv,
            ciphertext,
        })
    }
}

/// Derives a 32-byte AES key via PBKDF2-HMAC-SHA-256 from the fingerprint
/// concatenated with an optional passphrase (§4.1).
fn derive_key(fingerprint: &DeviceFingerprint, passphrase: Option<&str>, salt: &[u8]) -> [u8; 32] {
    let mut input = fingerprint.to_bytes();
    if let Some(p) = passphrase {
        input.push(b'|');
        input.extend_from_slice(p.as_bytes());
    }
    let mut key = [0u8; 32];
    pbkdf2_hmac::<Sha256>(&input, salt, PBKDF2_ITERATIONS, &mut key);
    input.zeroize();
    key
}

fn encrypt(
    plaintext: &str,
    fingerprint: &DeviceFingerprint,
    passphrase: Option<&str>,
) -> CredentialResult<EncryptedBlob> {
    let mut salt = [0u8; SALT_LEN];
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut iv);

    let mut key = derive_key(fingerprint, passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|_| CredentialError::NetworkError("invalid key length".to_string()))?;
    key.zeroize();

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
        .map_err(|_| CredentialError::DecryptionFailed)?;

    Ok(EncryptedBlob {
        salt,
        iv,
        ciphertext,
    })
}

fn decrypt(
    blob: &EncryptedBlob,
    fingerprint: &DeviceFingerprint,
    passphrase: Option<&str>,
) -> CredentialResult<String> {
    let mut key = derive_key(fingerprint, passphrase, &blob.salt);
    let cipher = Aes256Gcm::new_from_slice(&key)
        .map_err(|_| CredentialError::DecryptionFailed)?;
    key.zeroize();

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&blob.iv), blob.ciphertext.as_slice())
        .map_err(|_| CredentialError::DecryptionFailed)?;

    String::from_utf8(plaintext).map_err(|_| CredentialError::DecryptionFailed)
}

/// Trims and validates a candidate key per the format policy (§4.1).
///
/// Policy is intentionally not cryptographic: length and character class
/// only. Returns the trimmed key on success.
pub fn validate_format(s: &str) -> CredentialResult<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed.len() < 32 {
        return Err(CredentialError::InvalidFormat(
            "key must be at least 32 characters".to_string(),
        ));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(CredentialError::InvalidFormat(
            "key contains characters outside [A-Za-z0-9_-]".to_string(),
        ));
    }
    Ok(trimmed.to_string())
}

/// Non-cryptographic display helper (§4.1 `maskKey`).
pub fn mask_key(s: &str) -> String {
    if s.len() < 12 {
        return "***".to_string();
    }
    let head = &s[..8];
    let tail = &s[s.len() - 4..];
    let stars = "*".repeat(s.len() - 12);
    format!("{head}{stars}{tail}")
}

/// Persists and retrieves an encrypted recognition-service API key.
///
/// A value owned by the session manager, not a singleton (§9 "Replacing
/// class-based singletons"); construct with an explicit `dispose()`-free
/// lifetime tied to whoever holds it.
pub struct CredentialStore {
    kv: Arc<dyn KvStore>,
    http: reqwest::Client,
    fingerprint: DeviceFingerprint,
    passphrase: Option<String>,
    auth_check_url: String,
    namespace: String,
}

impl CredentialStore {
    pub fn new(
        kv: Arc<dyn KvStore>,
        fingerprint: DeviceFingerprint,
        passphrase: Option<String>,
        service_host: &str,
        namespace: &str,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client builds with sane defaults");
        Self {
            kv,
            http,
            fingerprint,
            passphrase,
            auth_check_url: format!("{}/v1/auth/token", service_host.trim_end_matches('/')),
            namespace: namespace.to_string(),
        }
    }

    fn ns_key(&self, suffix: &str) -> String {
        format!("{}.{}", self.namespace, suffix)
    }

    /// Issues a GET to the auth/token introspection endpoint (§4.1 `verify`).
    ///
    /// Idempotent; no state mutation on failure or success — callers that
    /// want persistence call [`CredentialStore::verify_and_save`].
    pub async fn verify(&self, api_key: &str) -> CredentialResult<VerifyOutcome> {
        let response = self
            .http
            .get(&self.auth_check_url)
            .header("Authorization", format!("Token {api_key}"))
            .send()
            .await
            .map_err(|e| CredentialError::NetworkError(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            #[derive(Deserialize)]
            struct Body {
                #[serde(default)]
                scopes: Vec<String>,
                #[serde(default)]
                project_uuid: String,
                #[serde(default)]
                expires: Option<i64>,
            }
            let body: Body = response
                .json()
                .await
                .map_err(|e| CredentialError::NetworkError(e.to_string()))?;
            return Ok(VerifyOutcome {
                scopes: body.scopes,
                project_id: body.project_uuid,
                expires_at: body.expires,
            });
        }

        Err(match status.as_u16() {
            401 => CredentialError::InvalidKey,
            403 => CredentialError::PermissionDenied,
            429 => CredentialError::RateLimited,
            500..=599 => CredentialError::ServiceUnavailable,
            _ => CredentialError::NetworkError(format!("unexpected status {status}")),
        })
    }

    /// Runs [`CredentialStore::verify`], then encrypts and persists the key.
    /// If any step fails, no storage mutation occurs (§4.1).
    pub async fn verify_and_save(&self, api_key: &str) -> CredentialResult<VerifyOutcome> {
        let trimmed = validate_format(api_key)?;
        let outcome = self.verify(&trimmed).await?;

        let blob = encrypt(&trimmed, &self.fingerprint, self.passphrase.as_deref())?;
        self.kv
            .set(&self.ns_key(KEY_ENCRYPTED), &blob.encode())
            .await
            .map_err(|e| CredentialError::NetworkError(e.to_string()))?;
        self.kv
            .set(
                &self.ns_key(KEY_VERIFIED_AT),
                &chrono::Utc::now().timestamp_millis().to_string(),
            )
            .await
            .map_err(|e| CredentialError::NetworkError(e.to_string()))?;
        self.kv
            .set(
                &self.ns_key(KEY_SCOPES),
                &serde_json::to_string(&outcome.scopes).unwrap_or_default(),
            )
            .await
            .map_err(|e| CredentialError::NetworkError(e.to_string()))?;
        self.kv
            .set(&self.ns_key(KEY_PROJECT_UUID), &outcome.project_id)
            .await
            .map_err(|e| CredentialError::NetworkError(e.to_string()))?;

        Ok(outcome)
    }

    /// Returns the plaintext API key (§4.1 `get`).
    ///
    /// `DecryptionFailed` signals device-binding mismatch; callers must
    /// treat it as "re-enter key", never as store corruption.
    pub async fn get(&self) -> CredentialResult<String> {
        let encoded = self
            .kv
            .get(&self.ns_key(KEY_ENCRYPTED))
            .await
            .map_err(|e| CredentialError::NetworkError(e.to_string()))?
            .ok_or(CredentialError::NotFound)?;

        let blob = EncryptedBlob::decode(&encoded)?;
        decrypt(&blob, &self.fingerprint, self.passphrase.as_deref())
    }

    /// Persists the active backend's recognition-mode tag (model/language
    /// preset), so a restored session can resume without re-prompting the
    /// user for that choice (§6 "Persisted state layout").
    pub async fn save_recognition_mode(&self, mode: &str) -> CredentialResult<()> {
        self.kv
            .set(&self.ns_key(KEY_RECOGNITION_MODE), mode)
            .await
            .map_err(|e| CredentialError::NetworkError(e.to_string()))
    }

    /// Returns the persisted recognition-mode tag, if any was saved.
    pub async fn recognition_mode(&self) -> CredentialResult<Option<String>> {
        self.kv
            .get(&self.ns_key(KEY_RECOGNITION_MODE))
            .await
            .map_err(|e| CredentialError::NetworkError(e.to_string()))
    }

    /// Deletes all entries associated with this credential (§4.1 `remove`).
    pub async fn remove(&self) -> CredentialResult<()> {
        for suffix in [
            KEY_ENCRYPTED,
            KEY_VERIFIED_AT,
            KEY_SCOPES,
            KEY_PROJECT_UUID,
            KEY_RECOGNITION_MODE,
        ] {
            self.kv
                .remove(&self.ns_key(suffix))
                .await
                .map_err(|e| CredentialError::NetworkError(e.to_string()))?;
        }
        Ok(())
    }

    /// Bounded projection of stored state that never exposes the plaintext.
    pub async fn info(&self) -> CredentialResult<CredentialInfo> {
        let present = self
            .kv
            .get(&self.ns_key(KEY_ENCRYPTED))
            .await
            .map_err(|e| CredentialError::NetworkError(e.to_string()))?
            .is_some();
        let verified_at = self
            .kv
            .get(&self.ns_key(KEY_VERIFIED_AT))
            .await
            .map_err(|e| CredentialError::NetworkError(e.to_string()))?
            .and_then(|s| s.parse::<i64>().ok());
        let scopes = self
            .kv
            .get(&self.ns_key(KEY_SCOPES))
            .await
            .map_err(|e| CredentialError::NetworkError(e.to_string()))?
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default();
        let project_id = self
            .kv
            .get(&self.ns_key(KEY_PROJECT_UUID))
            .await
            .map_err(|e| CredentialError::NetworkError(e.to_string()))?;

        Ok(CredentialInfo {
            present,
            scopes,
            verified_at,
            project_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryKvStore;

    fn fp() -> DeviceFingerprint {
        DeviceFingerprint {
            user_agent_token: "chrome-linux".to_string(),
            language: "en-US".to_string(),
            timezone_offset_min: 0,
            hardware_concurrency: 8,
            platform: "Linux x86_64".to_string(),
        }
    }

    #[test]
    fn validate_format_trims_then_checks_length() {
        let err = validate_format("  abc123  ").unwrap_err();
        assert_eq!(err.to_string(), "invalid key format: key must be at least 32 characters");
    }

    #[test]
    fn validate_format_rejects_bad_characters() {
        let key = format!("{}{}", "a".repeat(31), "!");
        assert!(validate_format(&key).is_err());
    }

    #[test]
    fn validate_format_accepts_well_formed_key() {
        let key = format!("sk-test-{}", "x".repeat(48));
        let out = validate_format(&format!("  {key}  ")).unwrap();
        assert_eq!(out, key);
    }

    #[test]
    fn mask_key_short_strings_become_stars() {
        assert_eq!(mask_key("short"), "***");
    }

    #[test]
    fn mask_key_masks_middle() {
        let key = "sk-test-0123456789abcd";
        let masked = mask_key(key);
        assert!(masked.starts_with("sk-test-"));
        assert!(masked.ends_with("abcd"));
        assert!(masked.contains('*'));
    }

    #[test]
    fn encrypt_then_decrypt_roundtrips_on_same_device() {
        let key = format!("sk-test-{}", "x".repeat(48));
        let blob = encrypt(&key, &fp(), None).unwrap();
        let out = decrypt(&blob, &fp(), None).unwrap();
        assert_eq!(out, key);
    }

    #[test]
    fn decrypt_fails_with_mutated_fingerprint() {
        let key = format!("sk-test-{}", "x".repeat(48));
        let blob = encrypt(&key, &fp(), None).unwrap();
        let mut other = fp();
        other.hardware_concurrency = 4;
        let err = decrypt(&blob, &other, None).unwrap_err();
        assert!(matches!(err, CredentialError::DecryptionFailed));
    }

    #[test]
    fn salt_and_iv_are_distinct_per_encryption() {
        let key = format!("sk-test-{}", "x".repeat(48));
        let a = encrypt(&key, &fp(), None).unwrap();
        let b = encrypt(&key, &fp(), None).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.iv, b.iv);
    }

    #[tokio::test]
    async fn get_without_stored_key_returns_not_found() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let store = CredentialStore::new(kv, fp(), None, "https://example.invalid", "stt");
        let err = store.get().await.unwrap_err();
        assert!(matches!(err, CredentialError::NotFound));
    }

    #[tokio::test]
    async fn recognition_mode_roundtrips_and_is_cleared_by_remove() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let store = CredentialStore::new(kv, fp(), None, "https://example.invalid", "stt");
        assert_eq!(store.recognition_mode().await.unwrap(), None);
        store.save_recognition_mode("nova-2:en").await.unwrap();
        assert_eq!(store.recognition_mode().await.unwrap(), Some("nova-2:en".to_string()));
        store.remove().await.unwrap();
        assert_eq!(store.recognition_mode().await.unwrap(), None);
    }

    #[tokio::test]
    async fn info_reports_absent_key_by_default() {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let store = CredentialStore::new(kv, fp(), None, "https://example.invalid", "stt");
        let info = store.info().await.unwrap();
        assert!(!info.present);
        assert!(info.scopes.is_empty());
    }
}
