//! redb-backed record store
//!
//! One table per record type, keyed by numeric id, values encoded with MessagePack.
//! Database: bastion.redb

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use super::models::{
    Acl, Group, GroupAcls, Host, NewUserKey, SessionRecord, SessionStatus, SshKey, User, UserKey,
};
use super::{RecordStore, StoreError};

type Table = TableDefinition<'static, u64, &'static [u8]>;

const USERS_TABLE: Table = TableDefinition::new("users");
const USER_KEYS_TABLE: Table = TableDefinition::new("user_keys");
const USER_GROUPS_TABLE: Table = TableDefinition::new("user_groups");
const HOST_GROUPS_TABLE: Table = TableDefinition::new("host_groups");
const ACLS_TABLE: Table = TableDefinition::new("acls");
const HOSTS_TABLE: Table = TableDefinition::new("hosts");
const SSH_KEYS_TABLE: Table = TableDefinition::new("ssh_keys");
const SESSIONS_TABLE: Table = TableDefinition::new("sessions");

const ALL_TABLES: [Table; 8] = [
    USERS_TABLE,
    USER_KEYS_TABLE,
    USER_GROUPS_TABLE,
    HOST_GROUPS_TABLE,
    ACLS_TABLE,
    HOSTS_TABLE,
    SSH_KEYS_TABLE,
    SESSIONS_TABLE,
];

/// Records addressed by a numeric id; id 0 means "not yet assigned"
pub trait HasId {
    fn id(&self) -> u64;
    fn set_id(&mut self, id: u64);
}

macro_rules! impl_has_id {
    ($($ty:ty),*) => {
        $(impl HasId for $ty {
            fn id(&self) -> u64 {
                self.id
            }
            fn set_id(&mut self, id: u64) {
                self.id = id;
            }
        })*
    };
}

impl_has_id!(User, UserKey, Group, Acl, Host, SshKey, SessionRecord);

/// Record store backed by a single redb file
pub struct RedbRecordStore {
    db: Arc<Database>,
}

impl RedbRecordStore {
    /// Open (or create) the store at the given path
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        info!("Record store opened at {:?}", path);

        // Secrets live in here: owner read/write only
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
                warn!("Failed to set record store permissions: {}", e);
            }
        }

        let store = Self { db: Arc::new(db) };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        for table in ALL_TABLES {
            let _ = write_txn.open_table(table)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Provisioning
    // ═══════════════════════════════════════════════════════════════════════

    pub fn put_user(&self, user: User) -> Result<User, StoreError> {
        self.put(USERS_TABLE, user)
    }

    pub fn put_user_key(&self, key: UserKey) -> Result<UserKey, StoreError> {
        self.put(USER_KEYS_TABLE, key)
    }

    pub fn put_user_group(&self, group: Group) -> Result<Group, StoreError> {
        self.put(USER_GROUPS_TABLE, group)
    }

    pub fn put_host_group(&self, group: Group) -> Result<Group, StoreError> {
        self.put(HOST_GROUPS_TABLE, group)
    }

    pub fn put_acl(&self, acl: Acl) -> Result<Acl, StoreError> {
        self.put(ACLS_TABLE, acl)
    }

    pub fn put_host(&self, host: Host) -> Result<Host, StoreError> {
        self.put(HOSTS_TABLE, host)
    }

    pub fn put_ssh_key(&self, key: SshKey) -> Result<SshKey, StoreError> {
        self.put(SSH_KEYS_TABLE, key)
    }

    pub fn session(&self, id: u64) -> Result<Option<SessionRecord>, StoreError> {
        self.get(SESSIONS_TABLE, id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Table helpers
    // ═══════════════════════════════════════════════════════════════════════

    /// Insert or replace a record, assigning the next free id when it has none
    fn put<T: Serialize + HasId>(&self, table: Table, mut record: T) -> Result<T, StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table)?;
            if record.id() == 0 {
                let last = table.last()?.map(|(key, _)| key.value());
                record.set_id(last.map_or(1, |id| id + 1));
            }
            let bytes = rmp_serde::to_vec_named(&record)?;
            table.insert(record.id(), bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(record)
    }

    fn get<T: DeserializeOwned>(&self, table: Table, id: u64) -> Result<Option<T>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        let record = match table.get(id)? {
            Some(bytes) => Some(rmp_serde::from_slice(bytes.value())?),
            None => None,
        };
        Ok(record)
    }

    fn get_many<T: DeserializeOwned>(&self, table: Table, ids: &[u64]) -> Result<Vec<T>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match table.get(*id)? {
                Some(bytes) => records.push(rmp_serde::from_slice(bytes.value())?),
                None => debug!("Dangling reference to record {}", id),
            }
        }
        Ok(records)
    }

    fn find<T: DeserializeOwned>(
        &self,
        table: Table,
        mut matches: impl FnMut(&T) -> bool,
    ) -> Result<Option<T>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        for entry in table.iter()? {
            let (_, bytes) = entry?;
            let record: T = rmp_serde::from_slice(bytes.value())?;
            if matches(&record) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Read-modify-write a single record in one transaction
    fn update<T: Serialize + DeserializeOwned>(
        &self,
        table: Table,
        id: u64,
        apply: impl FnOnce(&mut T),
    ) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write()?;
        let found = {
            let mut table = write_txn.open_table(table)?;
            let current = table
                .get(id)?
                .map(|bytes| rmp_serde::from_slice::<T>(bytes.value()))
                .transpose()?;
            match current {
                Some(mut record) => {
                    apply(&mut record);
                    let bytes = rmp_serde::to_vec_named(&record)?;
                    table.insert(id, bytes.as_slice())?;
                    true
                }
                None => false,
            }
        };
        write_txn.commit()?;
        Ok(found)
    }

    fn groups_with_acls(&self, table: Table, ids: &[u64]) -> Result<Vec<GroupAcls>, StoreError> {
        let groups: Vec<Group> = self.get_many(table, ids)?;
        groups
            .into_iter()
            .map(|group| {
                let acls = self.get_many(ACLS_TABLE, &group.acl_ids)?;
                Ok::<_, StoreError>(GroupAcls { group, acls })
            })
            .collect()
    }
}

#[async_trait]
impl RecordStore for RedbRecordStore {
    async fn user_by_id(&self, id: u64) -> Result<Option<User>, StoreError> {
        self.get(USERS_TABLE, id)
    }

    async fn user_key_by_authorized_key(
        &self,
        authorized_key: &str,
    ) -> Result<Option<UserKey>, StoreError> {
        let wanted = authorized_key.trim();
        self.find(USER_KEYS_TABLE, |key: &UserKey| key.authorized_key.trim() == wanted)
    }

    async fn redeem_invite(
        &self,
        token: &str,
        key: NewUserKey,
    ) -> Result<Option<User>, StoreError> {
        if token.is_empty() {
            return Ok(None);
        }

        let now = Utc::now();
        let write_txn = self.db.begin_write()?;
        let redeemed = {
            let mut users = write_txn.open_table(USERS_TABLE)?;
            let mut matched: Option<User> = None;
            for entry in users.iter()? {
                let (_, bytes) = entry?;
                let user: User = rmp_serde::from_slice(bytes.value())?;
                if user.invite_is_valid(now)
                    && bool::from(user.invite_token.as_bytes().ct_eq(token.as_bytes()))
                {
                    matched = Some(user);
                    break;
                }
            }

            match matched {
                Some(mut user) => {
                    let mut keys = write_txn.open_table(USER_KEYS_TABLE)?;
                    let last = keys.last()?.map(|(id, _)| id.value());
                    let user_key = UserKey {
                        id: last.map_or(1, |id| id + 1),
                        user_id: user.id,
                        authorized_key: key.authorized_key,
                        key_blob: key.key_blob,
                        comment: key.comment,
                        created_at: now,
                    };
                    let key_bytes = rmp_serde::to_vec_named(&user_key)?;
                    keys.insert(user_key.id, key_bytes.as_slice())?;

                    user.invite_token.clear();
                    user.invite_expires_at = None;
                    let user_bytes = rmp_serde::to_vec_named(&user)?;
                    users.insert(user.id, user_bytes.as_slice())?;
                    Some(user)
                }
                None => None,
            }
        };
        write_txn.commit()?;

        if let Some(user) = &redeemed {
            info!("Invite redeemed by user {} ({})", user.id, user.name);
        }
        Ok(redeemed)
    }

    async fn host_by_name(&self, name: &str) -> Result<Option<Host>, StoreError> {
        self.find(HOSTS_TABLE, |host: &Host| host.name == name)
    }

    async fn host_by_id(&self, id: u64) -> Result<Option<Host>, StoreError> {
        self.get(HOSTS_TABLE, id)
    }

    async fn ssh_key_by_id(&self, id: u64) -> Result<Option<SshKey>, StoreError> {
        self.get(SSH_KEYS_TABLE, id)
    }

    async fn ssh_key_by_name(&self, name: &str) -> Result<Option<SshKey>, StoreError> {
        self.find(SSH_KEYS_TABLE, |key: &SshKey| key.name == name)
    }

    async fn user_group_acls(&self, user: &User) -> Result<Vec<GroupAcls>, StoreError> {
        self.groups_with_acls(USER_GROUPS_TABLE, &user.group_ids)
    }

    async fn host_group_acls(&self, host: &Host) -> Result<Vec<GroupAcls>, StoreError> {
        self.groups_with_acls(HOST_GROUPS_TABLE, &host.group_ids)
    }

    async fn pin_host_key(&self, host_id: u64, key: &[u8]) -> Result<(), StoreError> {
        let found = self.update(HOSTS_TABLE, host_id, |host: &mut Host| {
            host.host_key = key.to_vec();
        })?;
        if !found {
            return Err(StoreError::NotFound(format!("host {}", host_id)));
        }
        Ok(())
    }

    async fn create_session(
        &self,
        user_id: u64,
        host_id: u64,
    ) -> Result<SessionRecord, StoreError> {
        let session = SessionRecord {
            id: 0,
            user_id,
            host_id,
            status: SessionStatus::Active,
            error: String::new(),
            created_at: Utc::now(),
            stopped_at: None,
        };
        self.put(SESSIONS_TABLE, session)
    }

    async fn close_session(&self, id: u64, error: &str) -> Result<(), StoreError> {
        let found = self.update(SESSIONS_TABLE, id, |session: &mut SessionRecord| {
            session.status = SessionStatus::Closed;
            session.error = error.to_string();
            session.stopped_at = Some(Utc::now());
        })?;
        if !found {
            return Err(StoreError::NotFound(format!("session {}", id)));
        }
        Ok(())
    }

    async fn close_active_sessions(&self, reason: &str) -> Result<usize, StoreError> {
        let now = Utc::now();
        let write_txn = self.db.begin_write()?;
        let closed = {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            let mut active = Vec::new();
            for entry in table.iter()? {
                let (_, bytes) = entry?;
                let session: SessionRecord = rmp_serde::from_slice(bytes.value())?;
                if session.status == SessionStatus::Active {
                    active.push(session);
                }
            }

            for session in &mut active {
                session.status = SessionStatus::Closed;
                session.error = reason.to_string();
                session.stopped_at = Some(now);
                let bytes = rmp_serde::to_vec_named(&*session)?;
                table.insert(session.id, bytes.as_slice())?;
            }
            active.len()
        };
        write_txn.commit()?;
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_test_store() -> (RedbRecordStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = RedbRecordStore::open(&dir.path().join("test.redb")).unwrap();
        (store, dir)
    }

    fn new_key(text: &str) -> NewUserKey {
        NewUserKey {
            authorized_key: text.to_string(),
            key_blob: text.as_bytes().to_vec(),
            comment: "created by sshbastion".to_string(),
        }
    }

    #[tokio::test]
    async fn test_put_assigns_sequential_ids() {
        let (store, _dir) = create_test_store();

        let a = store.put_host(Host { name: "a".into(), ..Default::default() }).unwrap();
        let b = store.put_host(Host { name: "b".into(), ..Default::default() }).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);

        let found = store.host_by_name("b").await.unwrap().unwrap();
        assert_eq!(found.id, 2);
        assert!(store.host_by_name("c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_group_acls_are_eager_loaded() {
        let (store, _dir) = create_test_store();

        let acl = store
            .put_acl(Acl { action: "allow".into(), weight: 3, ..Default::default() })
            .unwrap();
        let group = store
            .put_host_group(Group { name: "prod".into(), acl_ids: vec![acl.id], ..Default::default() })
            .unwrap();
        let host = store
            .put_host(Host { name: "db1".into(), group_ids: vec![group.id, 99], ..Default::default() })
            .unwrap();

        let loaded = store.host_group_acls(&host).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].group.name, "prod");
        assert_eq!(loaded[0].acls, vec![acl]);
    }

    #[tokio::test]
    async fn test_redeem_invite_is_single_use() {
        let (store, _dir) = create_test_store();
        let user = store
            .put_user(User {
                name: "alice".into(),
                email: "alice@example.com".into(),
                invite_token: "tok-123".into(),
                ..Default::default()
            })
            .unwrap();

        let redeemed = store.redeem_invite("tok-123", new_key("ssh-ed25519 AAAA")).await.unwrap();
        assert_eq!(redeemed.map(|u| u.id), Some(user.id));

        let stored = store.user_by_id(user.id).await.unwrap().unwrap();
        assert!(stored.invite_token.is_empty());

        let key = store
            .user_key_by_authorized_key("ssh-ed25519 AAAA")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key.user_id, user.id);

        let replay = store.redeem_invite("tok-123", new_key("ssh-ed25519 BBBB")).await.unwrap();
        assert!(replay.is_none());
        assert!(store
            .user_key_by_authorized_key("ssh-ed25519 BBBB")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_expired_invite_is_rejected() {
        let (store, _dir) = create_test_store();
        store
            .put_user(User {
                name: "bob".into(),
                invite_token: "old".into(),
                invite_expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
                ..Default::default()
            })
            .unwrap();

        assert!(store.redeem_invite("old", new_key("k")).await.unwrap().is_none());
        assert!(store.redeem_invite("", new_key("k")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pin_host_key() {
        let (store, _dir) = create_test_store();
        let host = store.put_host(Host { name: "web".into(), ..Default::default() }).unwrap();

        store.pin_host_key(host.id, b"key-bytes").await.unwrap();
        let host = store.host_by_id(host.id).await.unwrap().unwrap();
        assert_eq!(host.host_key, b"key-bytes");

        assert!(matches!(
            store.pin_host_key(42, b"x").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_session_lifecycle_and_startup_sweep() {
        let (store, _dir) = create_test_store();

        let first = store.create_session(1, 1).await.unwrap();
        let second = store.create_session(1, 2).await.unwrap();
        assert_eq!(first.status, SessionStatus::Active);

        store.close_session(first.id, "").await.unwrap();
        let closed = store.session(first.id).unwrap().unwrap();
        assert_eq!(closed.status, SessionStatus::Closed);
        assert!(closed.error.is_empty());
        assert!(closed.stopped_at.is_some());

        let swept = store.close_active_sessions("halted").await.unwrap();
        assert_eq!(swept, 1);
        let stale = store.session(second.id).unwrap().unwrap();
        assert_eq!(stale.status, SessionStatus::Closed);
        assert_eq!(stale.error, "halted");

        assert_eq!(store.close_active_sessions("halted").await.unwrap(), 0);
    }
}
