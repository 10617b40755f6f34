use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use percent_encoding::{percent_decode_str, percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

use crate::messaging::constants::{INSTANCE_ID_SUBDIRECTORY_NAME, MESSAGING_SUBDIRECTORY_NAME};
use crate::messaging::error::{storage_error, MessagingResult};
use crate::messaging::types::{Identity, ScopedToken, TokenOptions};

const IDENTITY_FILE: &str = "identity.json";
const TOKENS_DIR: &str = "tokens";
const RECORD_EXTENSION: &str = "json";
const STAGING_SUFFIX: &str = "tmp";
const LOCK_PRUNE_THRESHOLD: usize = 64;

/// Durable storage for checkin identities and scoped tokens.
///
/// Every operation is synchronous and atomic per key. Only the token manager
/// and checkin client mutate it.
pub trait CredentialStore: Send + Sync {
    fn get(&self, app_id: &str, scope: &str) -> MessagingResult<Option<ScopedToken>>;
    fn put(&self, token: &ScopedToken) -> MessagingResult<()>;
    /// Removes the token and returns it if it existed.
    fn delete(&self, app_id: &str, scope: &str) -> MessagingResult<Option<ScopedToken>>;
    fn scopes(&self, app_id: &str) -> MessagingResult<Vec<String>>;
    /// Removes every token of `app_id` and returns how many were removed.
    fn delete_all(&self, app_id: &str) -> MessagingResult<usize> {
        let mut removed = 0;
        for scope in self.scopes(app_id)? {
            if self.delete(app_id, &scope)?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn get_identity(&self, app_id: &str) -> MessagingResult<Option<Identity>>;
    fn put_identity(&self, app_id: &str, identity: &Identity) -> MessagingResult<()>;
    fn clear_identity(&self, app_id: &str) -> MessagingResult<()>;
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct PersistedIdentity {
    device_id: String,
    secret: String,
    last_checkin_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ttl_secs: Option<u64>,
}

impl PersistedIdentity {
    fn from_runtime(identity: &Identity) -> MessagingResult<Self> {
        Ok(Self {
            device_id: identity.device_id.clone(),
            secret: identity.secret.clone(),
            last_checkin_ms: system_time_to_millis(identity.last_checkin)?,
            ttl_secs: identity.ttl.map(|ttl| ttl.as_secs()),
        })
    }

    fn into_runtime(self) -> Identity {
        Identity {
            device_id: self.device_id,
            secret: self.secret,
            last_checkin: millis_to_system_time(self.last_checkin_ms),
            ttl: self.ttl_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
struct PersistedOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    apns_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    apns_sandbox: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gmp_app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    appid: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    extras: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
struct PersistedToken {
    app_id: String,
    scope: String,
    token: String,
    issued_at_ms: u64,
    device_id: String,
    #[serde(default)]
    options: PersistedOptions,
}

impl PersistedToken {
    fn from_runtime(token: &ScopedToken) -> MessagingResult<Self> {
        let options = &token.options;
        Ok(Self {
            app_id: token.app_id.clone(),
            scope: token.scope.clone(),
            token: token.token.clone(),
            issued_at_ms: system_time_to_millis(token.issued_at)?,
            device_id: token.device_id.clone(),
            options: PersistedOptions {
                apns_token: options.apns_token.as_ref().map(|bytes| STANDARD.encode(bytes)),
                apns_sandbox: options.apns_sandbox,
                gmp_app_id: options.firebase_app_id.clone(),
                appid: options.instance_id.clone(),
                extras: options.extras.clone(),
            },
        })
    }

    fn into_runtime(self) -> MessagingResult<ScopedToken> {
        let apns_token = match self.options.apns_token {
            Some(encoded) => Some(STANDARD.decode(encoded.as_bytes()).map_err(|err| {
                storage_error(format!("Stored APNS token is not valid base64: {err}"))
            })?),
            None => None,
        };
        Ok(ScopedToken {
            app_id: self.app_id,
            scope: self.scope,
            token: self.token,
            issued_at: millis_to_system_time(self.issued_at_ms),
            device_id: self.device_id,
            options: TokenOptions {
                apns_token,
                apns_sandbox: self.options.apns_sandbox,
                firebase_app_id: self.options.gmp_app_id,
                instance_id: self.options.appid,
                extras: self.options.extras,
            },
        })
    }
}

/// File-backed store rooted at `<cache_dir>/Google/FirebaseMessaging`.
///
/// Records are JSON files. A write goes to a staging file in the same
/// directory, is synced, then renamed over the committed record, so a crash
/// never leaves a partially written record behind.
#[derive(Clone, Debug)]
pub struct FileCredentialStore {
    root: Arc<PathBuf>,
    locks: Arc<Mutex<HashMap<PathBuf, Arc<RwLock<()>>>>>,
}

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

impl FileCredentialStore {
    /// Opens the store under `cache_dir`, migrating records left by the
    /// legacy instance-id directory if the messaging directory does not exist yet.
    pub fn open(cache_dir: impl AsRef<Path>) -> MessagingResult<Self> {
        let cache_dir = cache_dir.as_ref();
        let root = cache_dir.join(MESSAGING_SUBDIRECTORY_NAME);
        let legacy = cache_dir.join(INSTANCE_ID_SUBDIRECTORY_NAME);

        if legacy.is_dir() && !root.exists() {
            if let Some(parent) = root.parent() {
                fs::create_dir_all(parent).map_err(|err| io_error("create", parent, err))?;
            }
            fs::rename(&legacy, &root).map_err(|err| io_error("migrate", &legacy, err))?;
            log::info!(
                "migrated legacy credential directory '{}' to '{}'",
                legacy.display(),
                root.display()
            );
        }

        fs::create_dir_all(&root).map_err(|err| io_error("create", &root, err))?;
        Ok(Self {
            root: Arc::new(root),
            locks: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn app_dir(&self, app_id: &str) -> PathBuf {
        self.root.join(encode_component(app_id))
    }

    fn identity_path(&self, app_id: &str) -> PathBuf {
        self.app_dir(app_id).join(IDENTITY_FILE)
    }

    fn tokens_dir(&self, app_id: &str) -> PathBuf {
        self.app_dir(app_id).join(TOKENS_DIR)
    }

    fn token_path(&self, app_id: &str, scope: &str) -> PathBuf {
        self.tokens_dir(app_id)
            .join(format!("{}.{}", encode_component(scope), RECORD_EXTENSION))
    }

    fn lock_for(&self, path: &Path) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap();
        if locks.len() >= LOCK_PRUNE_THRESHOLD {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn read_bytes(&self, path: &Path) -> MessagingResult<Option<Vec<u8>>> {
        let lock = self.lock_for(path);
        let _guard = lock.read().unwrap();
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error("read", path, err)),
        }
    }

    fn read_record<T>(&self, path: &Path) -> MessagingResult<Option<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let Some(bytes) = self.read_bytes(path)? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&bytes).map_err(|err| {
            storage_error(format!(
                "Failed to parse credential record '{}': {}",
                path.display(),
                err
            ))
        })?;
        Ok(Some(record))
    }

    fn write_record<T: Serialize>(&self, path: &Path, record: &T) -> MessagingResult<()> {
        let bytes = serde_json::to_vec(record).map_err(|err| {
            storage_error(format!(
                "Failed to serialize credential record '{}': {}",
                path.display(),
                err
            ))
        })?;
        let lock = self.lock_for(path);
        let _guard = lock.write().unwrap();
        write_atomic(path, &bytes)
    }

    /// Reads and removes a record under a single write lock.
    fn take_record(&self, path: &Path) -> MessagingResult<Option<Vec<u8>>> {
        let lock = self.lock_for(path);
        let _guard = lock.write().unwrap();
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error("read", path, err)),
        };
        fs::remove_file(path).map_err(|err| io_error("delete", path, err))?;
        Ok(Some(bytes))
    }

    /// Removes a token record that still fails to decode once the write
    /// lock is held. A record rewritten in the meantime is kept.
    fn discard_unreadable_token(&self, path: &Path) -> MessagingResult<()> {
        let lock = self.lock_for(path);
        let _guard = lock.write().unwrap();
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(io_error("read", path, err)),
        };
        if decode_token(&bytes).is_err() {
            fs::remove_file(path).map_err(|err| io_error("delete", path, err))?;
        }
        Ok(())
    }

    fn remove_record(&self, path: &Path) -> MessagingResult<bool> {
        let lock = self.lock_for(path);
        let _guard = lock.write().unwrap();
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(io_error("delete", path, err)),
        }
    }
}

impl CredentialStore for FileCredentialStore {
    /// An unreadable record is discarded and reported as absent, so the
    /// next token request registers again.
    fn get(&self, app_id: &str, scope: &str) -> MessagingResult<Option<ScopedToken>> {
        let path = self.token_path(app_id, scope);
        let Some(bytes) = self.read_bytes(&path)? else {
            return Ok(None);
        };
        match decode_token(&bytes) {
            Ok(token) => Ok(Some(token)),
            Err(err) => {
                log::warn!("discarding unreadable token record '{}': {}", path.display(), err);
                self.discard_unreadable_token(&path)?;
                Ok(None)
            }
        }
    }

    fn put(&self, token: &ScopedToken) -> MessagingResult<()> {
        let record = PersistedToken::from_runtime(token)?;
        self.write_record(&self.token_path(&token.app_id, &token.scope), &record)
    }

    fn delete(&self, app_id: &str, scope: &str) -> MessagingResult<Option<ScopedToken>> {
        let path = self.token_path(app_id, scope);
        let Some(bytes) = self.take_record(&path)? else {
            return Ok(None);
        };
        // An unreadable record is still removed.
        match decode_token(&bytes) {
            Ok(token) => Ok(Some(token)),
            Err(err) => {
                log::warn!("discarded unreadable token record '{}': {}", path.display(), err);
                Ok(None)
            }
        }
    }

    fn scopes(&self, app_id: &str) -> MessagingResult<Vec<String>> {
        let dir = self.tokens_dir(app_id);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error("list", &dir, err)),
        };
        let mut scopes = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| io_error("list", &dir, err))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            // Staging files end in `.tmp` and are never committed records.
            let Some(stem) = name.strip_suffix(&format!(".{RECORD_EXTENSION}")) else {
                continue;
            };
            scopes.push(decode_component(stem)?);
        }
        scopes.sort();
        Ok(scopes)
    }

    fn get_identity(&self, app_id: &str) -> MessagingResult<Option<Identity>> {
        Ok(self
            .read_record::<PersistedIdentity>(&self.identity_path(app_id))?
            .map(PersistedIdentity::into_runtime))
    }

    fn put_identity(&self, app_id: &str, identity: &Identity) -> MessagingResult<()> {
        let record = PersistedIdentity::from_runtime(identity)?;
        self.write_record(&self.identity_path(app_id), &record)
    }

    fn clear_identity(&self, app_id: &str) -> MessagingResult<()> {
        self.remove_record(&self.identity_path(app_id)).map(|_| ())
    }
}

/// Non-durable store used by tests and hosts that do not want anything on disk.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    tokens: Mutex<HashMap<(String, String), ScopedToken>>,
    identities: Mutex<HashMap<String, Identity>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self, app_id: &str, scope: &str) -> MessagingResult<Option<ScopedToken>> {
        Ok(self
            .tokens
            .lock()
            .unwrap()
            .get(&(app_id.to_string(), scope.to_string()))
            .cloned())
    }

    fn put(&self, token: &ScopedToken) -> MessagingResult<()> {
        self.tokens
            .lock()
            .unwrap()
            .insert((token.app_id.clone(), token.scope.clone()), token.clone());
        Ok(())
    }

    fn delete(&self, app_id: &str, scope: &str) -> MessagingResult<Option<ScopedToken>> {
        Ok(self
            .tokens
            .lock()
            .unwrap()
            .remove(&(app_id.to_string(), scope.to_string())))
    }

    fn scopes(&self, app_id: &str) -> MessagingResult<Vec<String>> {
        let mut scopes: Vec<String> = self
            .tokens
            .lock()
            .unwrap()
            .keys()
            .filter(|(app, _)| app == app_id)
            .map(|(_, scope)| scope.clone())
            .collect();
        scopes.sort();
        Ok(scopes)
    }

    fn get_identity(&self, app_id: &str) -> MessagingResult<Option<Identity>> {
        Ok(self.identities.lock().unwrap().get(app_id).cloned())
    }

    fn put_identity(&self, app_id: &str, identity: &Identity) -> MessagingResult<()> {
        self.identities
            .lock()
            .unwrap()
            .insert(app_id.to_string(), identity.clone());
        Ok(())
    }

    fn clear_identity(&self, app_id: &str) -> MessagingResult<()> {
        self.identities.lock().unwrap().remove(app_id);
        Ok(())
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> MessagingResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| storage_error(format!("Record path '{}' has no parent", path.display())))?;
    fs::create_dir_all(parent).map_err(|err| io_error("create", parent, err))?;

    let staging = staging_path(path);
    let result = File::create(&staging)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|_| fs::rename(&staging, path));
    if let Err(err) = result {
        let _ = fs::remove_file(&staging);
        return Err(io_error("write", path, err));
    }
    // The rename is only durable once the directory entry is synced.
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}

fn decode_token(bytes: &[u8]) -> MessagingResult<ScopedToken> {
    serde_json::from_slice::<PersistedToken>(bytes)
        .map_err(|err| storage_error(format!("Failed to parse token record: {err}")))
        .and_then(PersistedToken::into_runtime)
}

fn staging_path(path: &Path) -> PathBuf {
    let id = STAGING_COUNTER.fetch_add(1, Ordering::SeqCst);
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".{}.{}.{}", std::process::id(), id, STAGING_SUFFIX));
    path.with_file_name(name)
}

fn encode_component(value: &str) -> String {
    percent_encode(value.as_bytes(), NON_ALPHANUMERIC).to_string()
}

fn decode_component(value: &str) -> MessagingResult<String> {
    percent_decode_str(value)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|err| storage_error(format!("Invalid record name '{value}': {err}")))
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> crate::messaging::error::MessagingError {
    storage_error(format!(
        "Failed to {} credential storage '{}': {}",
        action,
        path.display(),
        err
    ))
}

fn system_time_to_millis(time: SystemTime) -> MessagingResult<u64> {
    let duration = time
        .duration_since(UNIX_EPOCH)
        .map_err(|_| storage_error("Timestamps must be after UNIX epoch"))?;
    Ok(duration.as_millis() as u64)
}

fn millis_to_system_time(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}
