//! Persists auth tokens (and the shard/endpoint they go with) per sync scope.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::NResult;
use crate::models::Scope;

/// A token we've saved for a scope
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredToken {
    pub token: String,
    /// ms since epoch
    pub expires: i64,
    #[serde(default)]
    pub shard_id: Option<String>,
    #[serde(default)]
    pub note_store_url: Option<String>,
}

impl StoredToken {
    pub fn new(token: &str, expires: i64) -> StoredToken {
        StoredToken {
            token: String::from(token),
            expires: expires,
            shard_id: None,
            note_store_url: None,
        }
    }

    /// Whether this token is expired (or will be within `margin_ms`) at `now`
    pub fn is_expired(&self, now: i64, margin_ms: i64) -> bool {
        self.expires - margin_ms <= now
    }
}

pub trait CredentialStore: Send + Sync {
    fn read_token(&self, scope: &Scope) -> NResult<Option<StoredToken>>;
    fn write_token(&self, scope: &Scope, token: &StoredToken) -> NResult<()>;
    fn delete_token(&self, scope: &Scope) -> NResult<()>;
}

/// Keeps tokens in memory. Forgets everything when dropped.
#[derive(Default)]
pub struct MemoryCredentials {
    tokens: RwLock<HashMap<Scope, StoredToken>>,
}

impl MemoryCredentials {
    pub fn new() -> MemoryCredentials {
        Default::default()
    }
}

impl CredentialStore for MemoryCredentials {
    fn read_token(&self, scope: &Scope) -> NResult<Option<StoredToken>> {
        Ok(lockr!(self.tokens).get(scope).cloned())
    }

    fn write_token(&self, scope: &Scope, token: &StoredToken) -> NResult<()> {
        lockw!(self.tokens).insert(scope.clone(), token.clone());
        Ok(())
    }

    fn delete_token(&self, scope: &Scope) -> NResult<()> {
        lockw!(self.tokens).remove(scope);
        Ok(())
    }
}

/// Keeps tokens in a JSON file, keyed by scope (`primary`, `linked:<guid>`).
/// The whole file is rewritten on every change.
pub struct FileCredentials {
    path: PathBuf,
    tokens: RwLock<HashMap<String, StoredToken>>,
}

impl FileCredentials {
    /// Open (or start) a credentials file
    pub fn open<P: AsRef<Path>>(path: P) -> NResult<FileCredentials> {
        let path = path.as_ref().to_path_buf();
        let tokens: HashMap<String, StoredToken> = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            if contents.trim().is_empty() {
                HashMap::new()
            } else {
                jedi::parse(&contents)?
            }
        } else {
            HashMap::new()
        };
        debug!("FileCredentials.open() -- loaded {} tokens from {:?}", tokens.len(), path);
        Ok(FileCredentials {
            path: path,
            tokens: RwLock::new(tokens),
        })
    }

    fn save(&self, tokens: &HashMap<String, StoredToken>) -> NResult<()> {
        let contents = jedi::stringify(tokens)?;
        fs::write(&self.path, contents)?;
        Ok(())
    }
}

impl CredentialStore for FileCredentials {
    fn read_token(&self, scope: &Scope) -> NResult<Option<StoredToken>> {
        Ok(lockr!(self.tokens).get(&scope.to_string()).cloned())
    }

    fn write_token(&self, scope: &Scope, token: &StoredToken) -> NResult<()> {
        let mut guard = lockw!(self.tokens);
        guard.insert(scope.to_string(), token.clone());
        self.save(&guard)
    }

    fn delete_token(&self, scope: &Scope) -> NResult<()> {
        let mut guard = lockw!(self.tokens);
        if guard.remove(&scope.to_string()).is_some() {
            self.save(&guard)?;
        }
        Ok(())
    }
}
