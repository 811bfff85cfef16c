//! Object storage for extensions.
//!
//! Objects live in a redb database, namespaced as `<extension>/<key>`.
//! Downloads go through time-limited URLs signed with HMAC-SHA256 over
//! `<extension>/<key>:<expires>`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use redb::{Database, ReadableTable, TableDefinition};
use sha2::Sha256;

use hearth_core::extension::{ObjectInfo, Result as ExtResult, StorageProvider, StorageService};

use crate::error::{Error, Result};

// key = "<extension>/<key>", value = object bytes
const OBJECTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");
// key = "<extension>/<key>", value = ObjectInfo (JSON)
const META_TABLE: TableDefinition<&str, &str> = TableDefinition::new("object_meta");

const MAX_KEY_LEN: usize = 512;

type HmacSha256 = Hmac<Sha256>;

/// Configuration for [`ObjectStore`].
#[derive(Debug, Clone)]
pub struct ObjectStoreConfig {
    /// Database file. `None` keeps objects in memory.
    pub path: Option<PathBuf>,
    /// Secret used to sign download URLs.
    pub signing_secret: String,
    /// Base URL prepended to signed paths, without trailing slash.
    pub public_url: String,
}

impl ObjectStoreConfig {
    pub fn new(signing_secret: impl Into<String>) -> Self {
        Self {
            path: None,
            signing_secret: signing_secret.into(),
            public_url: String::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_public_url(mut self, url: impl Into<String>) -> Self {
        self.public_url = url.into().trim_end_matches('/').to_string();
        self
    }
}

struct StoreInner {
    db: Database,
    secret: Vec<u8>,
    public_url: String,
}

/// redb-backed object store shared by all extensions. Cheap to clone.
#[derive(Clone)]
pub struct ObjectStore {
    inner: Arc<StoreInner>,
}

impl ObjectStore {
    pub fn open(config: ObjectStoreConfig) -> Result<Self> {
        if config.signing_secret.is_empty() {
            return Err(Error::InvalidInput("signing secret must not be empty".to_string()));
        }

        let db = match &config.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Database::create(path)?
            }
            None => Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?,
        };

        // Create tables up front so read transactions never miss them
        let txn = db.begin_write()?;
        {
            txn.open_table(OBJECTS_TABLE)?;
            txn.open_table(META_TABLE)?;
        }
        txn.commit()?;

        Ok(Self {
            inner: Arc::new(StoreInner {
                db,
                secret: config.signing_secret.into_bytes(),
                public_url: config.public_url,
            }),
        })
    }

    pub fn put(&self, extension: &str, key: &str, data: &[u8], content_type: Option<&str>) -> Result<ObjectInfo> {
        validate_key(key)?;
        let info = ObjectInfo {
            key: key.to_string(),
            size: data.len() as u64,
            content_type: content_type.map(str::to_string),
            updated_at: Utc::now().timestamp(),
        };
        let full = full_key(extension, key);
        let meta = serde_json::to_string(&info)?;

        let txn = self.inner.db.begin_write()?;
        {
            let mut objects = txn.open_table(OBJECTS_TABLE)?;
            objects.insert(full.as_str(), data)?;
            let mut metas = txn.open_table(META_TABLE)?;
            metas.insert(full.as_str(), meta.as_str())?;
        }
        txn.commit()?;
        Ok(info)
    }

    pub fn get(&self, extension: &str, key: &str) -> Result<Option<(ObjectInfo, Vec<u8>)>> {
        validate_key(key)?;
        let full = full_key(extension, key);
        let txn = self.inner.db.begin_read()?;
        let objects = txn.open_table(OBJECTS_TABLE)?;
        let metas = txn.open_table(META_TABLE)?;

        let data = match objects.get(full.as_str())? {
            Some(data) => data.value().to_vec(),
            None => return Ok(None),
        };
        let info = match metas.get(full.as_str())? {
            Some(meta) => serde_json::from_str(meta.value())?,
            None => ObjectInfo {
                key: key.to_string(),
                size: data.len() as u64,
                content_type: None,
                updated_at: 0,
            },
        };
        Ok(Some((info, data)))
    }

    pub fn delete(&self, extension: &str, key: &str) -> Result<bool> {
        validate_key(key)?;
        let full = full_key(extension, key);
        let txn = self.inner.db.begin_write()?;
        let removed = {
            let mut objects = txn.open_table(OBJECTS_TABLE)?;
            let removed = objects.remove(full.as_str())?.is_some();
            let mut metas = txn.open_table(META_TABLE)?;
            metas.remove(full.as_str())?;
            removed
        };
        txn.commit()?;
        Ok(removed)
    }

    /// Objects of `extension` whose key starts with `prefix`, ordered by key.
    pub fn list(&self, extension: &str, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let start = full_key(extension, prefix);
        let txn = self.inner.db.begin_read()?;
        let metas = txn.open_table(META_TABLE)?;

        let mut out = Vec::new();
        for entry in metas.range(start.as_str()..)? {
            let (key, meta) = entry?;
            if !key.value().starts_with(start.as_str()) {
                break;
            }
            out.push(serde_json::from_str(meta.value())?);
        }
        Ok(out)
    }

    /// Signature over an object and expiry timestamp (unix seconds).
    pub fn sign(&self, extension: &str, key: &str, expires: i64) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(signing_payload(extension, key, expires).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Download URL valid for `ttl`.
    pub fn signed_url(&self, extension: &str, key: &str, ttl: Duration) -> Result<String> {
        validate_key(key)?;
        let ttl = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires = Utc::now().timestamp().saturating_add(ttl);
        let signature = self.sign(extension, key, expires)?;
        Ok(format!(
            "{}/storage/{}/{}?expires={}&signature={}",
            self.inner.public_url, extension, key, expires, signature
        ))
    }

    /// Check a signature and expiry against the current time.
    pub fn verify(&self, extension: &str, key: &str, expires: i64, signature: &str) -> Result<()> {
        if expires < Utc::now().timestamp() {
            return Err(Error::InvalidSignature("link expired".to_string()));
        }
        let provided =
            hex::decode(signature).map_err(|_| Error::InvalidSignature("malformed signature".to_string()))?;
        let mut mac = self.mac()?;
        mac.update(signing_payload(extension, key, expires).as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| Error::InvalidSignature("signature mismatch".to_string()))
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.inner.secret).map_err(|e| Error::InvalidInput(e.to_string()))
    }
}

impl StorageProvider for ObjectStore {
    fn for_extension(&self, extension: &str) -> Arc<dyn StorageService> {
        Arc::new(ExtensionObjects {
            store: self.clone(),
            extension: extension.to_string(),
        })
    }
}

/// Object storage view of one extension.
struct ExtensionObjects {
    store: ObjectStore,
    extension: String,
}

#[async_trait]
impl StorageService for ExtensionObjects {
    async fn put(&self, key: &str, data: Vec<u8>, content_type: Option<&str>) -> ExtResult<ObjectInfo> {
        Ok(self.store.put(&self.extension, key, &data, content_type)?)
    }

    async fn get(&self, key: &str) -> ExtResult<Option<(ObjectInfo, Vec<u8>)>> {
        Ok(self.store.get(&self.extension, key)?)
    }

    async fn delete(&self, key: &str) -> ExtResult<bool> {
        Ok(self.store.delete(&self.extension, key)?)
    }

    async fn list(&self, prefix: &str) -> ExtResult<Vec<ObjectInfo>> {
        Ok(self.store.list(&self.extension, prefix)?)
    }

    async fn signed_url(&self, key: &str, ttl: Duration) -> ExtResult<String> {
        Ok(self.store.signed_url(&self.extension, key, ttl)?)
    }
}

fn full_key(extension: &str, key: &str) -> String {
    let mut result = String::with_capacity(extension.len() + key.len() + 1);
    result.push_str(extension);
    result.push('/');
    result.push_str(key);
    result
}

fn signing_payload(extension: &str, key: &str, expires: i64) -> String {
    format!("{}/{}:{}", extension, key, expires)
}

/// Keys are relative paths of `[A-Za-z0-9._-]` segments.
pub fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key.starts_with('/')
        && !key.ends_with('/')
        && key
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid object key {:?}", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ObjectStore {
        ObjectStore::open(ObjectStoreConfig::new("test-secret").with_public_url("http://localhost:8080/"))
            .unwrap()
    }

    #[test]
    fn test_key_validation() {
        assert!(validate_key("images/logo.png").is_ok());
        assert!(validate_key("a").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("spaces here").is_err());
    }

    #[test]
    fn test_put_get_delete() {
        let store = store();
        let info = store
            .put("cloud-storage", "docs/readme.txt", b"hello", Some("text/plain"))
            .unwrap();
        assert_eq!(info.size, 5);

        let (info, data) = store.get("cloud-storage", "docs/readme.txt").unwrap().unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(info.content_type.as_deref(), Some("text/plain"));

        // Namespaced per extension
        assert!(store.get("analytics", "docs/readme.txt").unwrap().is_none());

        assert!(store.delete("cloud-storage", "docs/readme.txt").unwrap());
        assert!(!store.delete("cloud-storage", "docs/readme.txt").unwrap());
    }

    #[test]
    fn test_list_by_prefix() {
        let store = store();
        store.put("a", "img/1.png", b"1", None).unwrap();
        store.put("a", "img/2.png", b"2", None).unwrap();
        store.put("a", "doc/1.txt", b"3", None).unwrap();
        store.put("ab", "img/3.png", b"4", None).unwrap();

        let keys: Vec<String> = store.list("a", "img/").unwrap().into_iter().map(|o| o.key).collect();
        assert_eq!(keys, vec!["img/1.png", "img/2.png"]);
        assert_eq!(store.list("a", "").unwrap().len(), 3);
    }

    #[test]
    fn test_signed_url_round_trip() {
        let store = store();
        let url = store
            .signed_url("cloud-storage", "a.txt", Duration::from_secs(60))
            .unwrap();
        assert!(url.starts_with("http://localhost:8080/storage/cloud-storage/a.txt?expires="));

        let expires = Utc::now().timestamp() + 60;
        let signature = store.sign("cloud-storage", "a.txt", expires).unwrap();
        assert!(store.verify("cloud-storage", "a.txt", expires, &signature).is_ok());
        assert!(store.verify("cloud-storage", "b.txt", expires, &signature).is_err());
        assert!(store.verify("analytics", "a.txt", expires, &signature).is_err());
        assert!(store.verify("cloud-storage", "a.txt", expires + 1, &signature).is_err());
    }

    #[test]
    fn test_expired_signature_rejected() {
        let store = store();
        let expires = Utc::now().timestamp() - 1;
        let signature = store.sign("x", "k", expires).unwrap();
        assert!(matches!(
            store.verify("x", "k", expires, &signature),
            Err(Error::InvalidSignature(_))
        ));
    }
}
