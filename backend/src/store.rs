use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use santa_core::{can_access_event, Event, EventId, User, UserId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::StoreError;

/// Which backend holds users and events. Chosen once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    Memory,
    JsonFiles { dir: PathBuf },
}

pub async fn open(config: &StorageConfig) -> Result<Arc<dyn Store>, StoreError> {
    match config {
        StorageConfig::Memory => {
            info!("using in-memory storage");
            Ok(Arc::new(MemoryStore::default()))
        }
        StorageConfig::JsonFiles { dir } => {
            tokio::fs::create_dir_all(dir).await?;
            info!(dir = %dir.display(), "using json file storage");
            Ok(Arc::new(JsonFileStore::new(dir)))
        }
    }
}

/// Users and events, each written as a whole record.
///
/// `upsert_event` is the only way an event reaches storage. It accepts the
/// write only if the stored revision still matches the one the caller read,
/// and bumps `event.revision` on success.
#[async_trait]
pub trait Store: Send + Sync {
    async fn load_users(&self) -> Result<HashMap<UserId, User>, StoreError>;
    async fn load_events(&self) -> Result<HashMap<EventId, Event>, StoreError>;
    async fn upsert_user(&self, user: &User) -> Result<(), StoreError>;
    /// Replaces the whole user collection.
    async fn replace_users(&self, users: HashMap<UserId, User>) -> Result<(), StoreError>;
    async fn upsert_event(&self, event: &mut Event) -> Result<(), StoreError>;
    /// Returns whether a record was removed.
    async fn delete_event(&self, event_id: &str) -> Result<bool, StoreError>;

    async fn get_event(&self, event_id: &str) -> Result<Option<Event>, StoreError> {
        Ok(self.load_events().await?.remove(event_id))
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.load_users().await?.remove(user_id))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .load_users()
            .await?
            .into_values()
            .find(|u| u.email == email))
    }

    /// Events the user takes part in or created, newest first.
    async fn find_events_for_user(&self, user_id: &str) -> Result<Vec<Event>, StoreError> {
        let mut events: Vec<Event> = self
            .load_events()
            .await?
            .into_values()
            .filter(|e| can_access_event(e, user_id))
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(events)
    }
}

fn stamp_revision(stored: Option<&Event>, event: &mut Event) -> Result<(), StoreError> {
    let fresh = match stored {
        Some(current) => current.revision == event.revision,
        // A record that was read before must still exist.
        None => event.revision == 0,
    };
    if !fresh {
        return Err(StoreError::ConcurrentModification {
            event_id: event.id.clone(),
        });
    }
    event.revision += 1;
    Ok(())
}

#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<UserId, User>>,
    events: RwLock<HashMap<EventId, Event>>,
}

impl MemoryStore {
    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        Self {
            users: RwLock::new(users.into_iter().map(|u| (u.id.clone(), u)).collect()),
            events: RwLock::default(),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_users(&self) -> Result<HashMap<UserId, User>, StoreError> {
        Ok(self.users.read().await.clone())
    }

    async fn load_events(&self) -> Result<HashMap<EventId, Event>, StoreError> {
        Ok(self.events.read().await.clone())
    }

    async fn upsert_user(&self, user: &User) -> Result<(), StoreError> {
        self.users.write().await.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn replace_users(&self, users: HashMap<UserId, User>) -> Result<(), StoreError> {
        *self.users.write().await = users;
        Ok(())
    }

    async fn upsert_event(&self, event: &mut Event) -> Result<(), StoreError> {
        let mut events = self.events.write().await;
        stamp_revision(events.get(&event.id), event)?;
        events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn delete_event(&self, event_id: &str) -> Result<bool, StoreError> {
        Ok(self.events.write().await.remove(event_id).is_some())
    }

    async fn get_event(&self, event_id: &str) -> Result<Option<Event>, StoreError> {
        Ok(self.events.read().await.get(event_id).cloned())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.read().await.get(user_id).cloned())
    }
}

/// `users.json` and `events.json` in one directory, each a map from id to record.
pub struct JsonFileStore {
    users_path: PathBuf,
    events_path: PathBuf,
    // Serialises read-modify-write of a whole collection.
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub const USERS_FILE: &'static str = "users.json";
    pub const EVENTS_FILE: &'static str = "events.json";

    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            users_path: dir.join(Self::USERS_FILE),
            events_path: dir.join(Self::EVENTS_FILE),
            write_lock: Mutex::new(()),
        }
    }
}

async fn read_map<T: DeserializeOwned>(path: &Path) -> Result<HashMap<String, T>, StoreError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "no data file yet");
            Ok(HashMap::new())
        }
        Err(err) => Err(err.into()),
    }
}

async fn write_map<T: Serialize>(path: &Path, map: &HashMap<String, T>) -> Result<(), StoreError> {
    let ordered: BTreeMap<&String, &T> = map.iter().collect();
    let json = serde_json::to_vec_pretty(&ordered)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl Store for JsonFileStore {
    async fn load_users(&self) -> Result<HashMap<UserId, User>, StoreError> {
        read_map(&self.users_path).await
    }

    async fn load_events(&self) -> Result<HashMap<EventId, Event>, StoreError> {
        read_map(&self.events_path).await
    }

    async fn upsert_user(&self, user: &User) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut users: HashMap<UserId, User> = read_map(&self.users_path).await?;
        users.insert(user.id.clone(), user.clone());
        write_map(&self.users_path, &users).await
    }

    async fn replace_users(&self, users: HashMap<UserId, User>) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        write_map(&self.users_path, &users).await
    }

    async fn upsert_event(&self, event: &mut Event) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut events: HashMap<EventId, Event> = read_map(&self.events_path).await?;
        let before = event.revision;
        stamp_revision(events.get(&event.id), event)?;
        events.insert(event.id.clone(), event.clone());
        if let Err(err) = write_map(&self.events_path, &events).await {
            event.revision = before;
            return Err(err);
        }
        Ok(())
    }

    async fn delete_event(&self, event_id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut events: HashMap<EventId, Event> = read_map(&self.events_path).await?;
        if events.remove(event_id).is_none() {
            return Ok(false);
        }
        write_map(&self.events_path, &events).await?;
        Ok(true)
    }
}
