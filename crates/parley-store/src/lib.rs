//! SQLite-backed persistence for the conversation core.
//!
//! All relational state lives here: dialogues, memberships, messages,
//! per-device envelopes, the seen-by / deleted-by join tables, and the
//! read-only device key registry. Synchronous SQLite I/O is confined to
//! [`ChatStore`]; async callers go through [`Store`], which runs every
//! operation on a blocking thread (the same arrangement the relay uses
//! for its username directory).

mod devices;
mod dialogues;
mod error;
mod messages;
mod records;
mod roles;

pub use error::StoreError;
pub use records::{
    DeviceKey, Dialogue, Envelope, NewDialogue, NewMessage, Participant, StoredMessage,
};
pub use roles::RoleChange;

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS dialogues (
    id              TEXT PRIMARY KEY NOT NULL,
    slug            TEXT NOT NULL UNIQUE,
    is_group        INTEGER NOT NULL,
    last_message_id TEXT,
    created_at_ms   INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS participants (
    dialogue_id     TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    role            TEXT NOT NULL CHECK (role IN ('participant','elder','founder')),
    joined_at_ms    INTEGER NOT NULL,
    UNIQUE (dialogue_id, user_id)
);
CREATE INDEX IF NOT EXISTS idx_participants_user ON participants(user_id);
CREATE TABLE IF NOT EXISTS messages (
    id                  TEXT PRIMARY KEY NOT NULL,
    dialogue_id         TEXT NOT NULL,
    sender_id           TEXT NOT NULL,
    sender_device_id    TEXT,
    created_at_ms       INTEGER NOT NULL,
    edited_at_ms        INTEGER,
    is_edited           INTEGER NOT NULL DEFAULT 0,
    delivered           INTEGER NOT NULL DEFAULT 0,
    content             TEXT NOT NULL,
    attachments         TEXT,
    self_destruct_at_ms INTEGER,
    system_event        TEXT
);
CREATE INDEX IF NOT EXISTS idx_messages_dialogue ON messages(dialogue_id, created_at_ms);
CREATE INDEX IF NOT EXISTS idx_messages_undelivered ON messages(delivered) WHERE delivered = 0;
CREATE TABLE IF NOT EXISTS message_envelopes (
    message_id  TEXT NOT NULL,
    device_id   TEXT NOT NULL,
    ciphertext  TEXT NOT NULL,
    UNIQUE (message_id, device_id)
);
CREATE TABLE IF NOT EXISTS message_seen (
    message_id  TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    UNIQUE (message_id, user_id)
);
CREATE TABLE IF NOT EXISTS message_deleted (
    message_id  TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    UNIQUE (message_id, user_id)
);
CREATE TABLE IF NOT EXISTS dialogue_deleted (
    dialogue_id TEXT NOT NULL,
    user_id     TEXT NOT NULL,
    UNIQUE (dialogue_id, user_id)
);
CREATE TABLE IF NOT EXISTS device_keys (
    device_id           TEXT PRIMARY KEY NOT NULL,
    user_id             TEXT NOT NULL,
    public_key          TEXT NOT NULL,
    is_active           INTEGER NOT NULL DEFAULT 1,
    is_verified         INTEGER NOT NULL DEFAULT 0,
    last_used_at_ms     INTEGER,
    proof_expires_at_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_device_keys_user ON device_keys(user_id);
";

/// Synchronous SQLite store. One connection behind a `std` mutex.
pub struct ChatStore {
    conn: StdMutex<Connection>,
}

// Safety: rusqlite::Connection is Send but not Sync. The std Mutex makes
// &ChatStore safe to share across threads.
unsafe impl Sync for ChatStore {}

impl ChatStore {
    /// Open (and migrate) the database. `None` opens an in-memory store.
    pub fn open(path: Option<&Path>) -> Result<Self, StoreError> {
        let conn = match path {
            Some(p) => {
                if let Some(dir) = p.parent() {
                    std::fs::create_dir_all(dir).ok();
                }
                Connection::open(p)?
            }
            None => Connection::open_in_memory()?,
        };

        // WAL for concurrent readers alongside the single writer.
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: StdMutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }
}

/// Async facade over [`ChatStore`]. Cheap to clone; every call runs on a
/// blocking thread so SQLite never stalls the runtime.
#[derive(Clone)]
pub struct Store {
    inner: Arc<ChatStore>,
}

impl Store {
    pub fn new(store: ChatStore) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    pub fn open(path: Option<&Path>) -> Result<Self, StoreError> {
        Ok(Self::new(ChatStore::open(path)?))
    }

    /// Run a closure against the blocking store.
    pub async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&ChatStore) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|_| StoreError::Unavailable)?
    }

    /// Direct access for synchronous test setup.
    pub fn blocking(&self) -> &ChatStore {
        &self.inner
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use parley_proto::Role;

    pub fn mem() -> ChatStore {
        ChatStore::open(None).unwrap()
    }

    /// A 3-member group: founder "f", elder "e", participant "p".
    pub fn seed_group(store: &ChatStore) -> Dialogue {
        let d = store
            .create_dialogue(NewDialogue {
                id: "g1".into(),
                slug: "test-group".into(),
                is_group: true,
                founder: Some("f".into()),
                members: vec!["f".into(), "e".into(), "p".into()],
                created_at_ms: 1_000,
            })
            .unwrap();
        store.set_role_for_test(&d.id, "e", Role::Elder);
        d
    }

    /// A direct dialogue between "a" and "b".
    pub fn seed_direct(store: &ChatStore) -> Dialogue {
        store
            .create_dialogue(NewDialogue {
                id: "d1".into(),
                slug: "a-b".into(),
                is_group: false,
                founder: None,
                members: vec!["a".into(), "b".into()],
                created_at_ms: 1_000,
            })
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_and_migrate() {
        let store = ChatStore::open(None).unwrap();
        assert!(store.dialogue("missing").unwrap().is_none());
    }

    #[test]
    fn open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.db");
        {
            let store = ChatStore::open(Some(&path)).unwrap();
            store
                .create_dialogue(NewDialogue {
                    id: "d1".into(),
                    slug: "a-b".into(),
                    is_group: false,
                    founder: None,
                    members: vec!["a".into(), "b".into()],
                    created_at_ms: 1,
                })
                .unwrap();
        }
        let store = ChatStore::open(Some(&path)).unwrap();
        assert!(store.dialogue("d1").unwrap().is_some());
    }

    #[tokio::test]
    async fn async_facade_runs_on_blocking_thread() {
        let store = Store::open(None).unwrap();
        let found = store.run(|s| s.dialogue("nope")).await.unwrap();
        assert!(found.is_none());
    }
}
