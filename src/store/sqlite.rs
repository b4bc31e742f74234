//! SQLite document store.
//!
//! Every entity is one JSON document in its collection table. Conditional
//! writes read, match and rewrite a single document inside one
//! `BEGIN IMMEDIATE` transaction, so concurrent writers on other connections
//! or processes serialize on the database write lock.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::{
    AppId, Application, District, DistrictId, Domain, DomainId, OperationGroup, OperationRecord,
    Owner, OwnerId, WallClock,
};

use super::{
    AppProjection, DocumentStore, GroupSlot, LockRecord, OpSlot, OpUpdate, StoreError,
    apply_op_update, apply_pull_finished_group, apply_push_record,
};

const STORE_SCHEMA_VERSION: u32 = 1;
const BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Clone, Copy)]
struct Collection {
    name: &'static str,
    table: &'static str,
}

const OWNERS: Collection = Collection {
    name: "owner",
    table: "owners",
};
const DOMAINS: Collection = Collection {
    name: "domain",
    table: "domains",
};
const APPLICATIONS: Collection = Collection {
    name: "application",
    table: "applications",
};
const DISTRICTS: Collection = Collection {
    name: "district",
    table: "districts",
};

#[derive(Clone, Debug)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (creating if needed) the store database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            reject_symlink(parent)?;
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        reject_symlink(path)?;

        let conn = open_connection(path, true)?;
        if table_exists(&conn, "meta")? {
            validate_schema_version(&conn)?;
        } else {
            initialize_schema(&conn)?;
        }
        ensure_permissions(path)?;
        drop(conn);

        Ok(Self {
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = open_connection(&self.db_path, false)?;
        f(&mut conn)
    }

    fn put_doc<T: Serialize>(
        &self,
        collection: Collection,
        id: String,
        columns: &[(&'static str, String)],
        doc: &T,
    ) -> Result<(), StoreError> {
        let text = encode(collection, doc)?;
        let mut names = vec!["id", "doc"];
        names.extend(columns.iter().map(|(name, _)| *name));
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
            collection.table,
            names.join(", "),
            placeholders.join(", ")
        );
        let mut values = vec![id, text];
        values.extend(columns.iter().map(|(_, value)| value.clone()));
        self.with_conn(|conn| {
            conn.execute(&sql, rusqlite::params_from_iter(values.iter()))?;
            Ok(())
        })
    }

    fn find_doc<T: DeserializeOwned>(
        &self,
        collection: Collection,
        id: String,
        select: &str,
    ) -> Result<Option<T>, StoreError> {
        let sql = format!("SELECT {select} FROM {} WHERE id = ?1", collection.table);
        self.with_conn(|conn| {
            let text: Option<String> = conn
                .query_row(&sql, params![id], |row| row.get(0))
                .optional()?;
            text.map(|text| decode(collection, &id, &text)).transpose()
        })
    }

    fn scan_docs<T: DeserializeOwned>(
        &self,
        collection: Collection,
        select: &str,
        filter: Option<(&str, String)>,
        visit: &mut dyn FnMut(T) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let sql = match &filter {
            Some((column, _)) => format!(
                "SELECT id, {select} FROM {} WHERE {column} = ?1 ORDER BY id",
                collection.table
            ),
            None => format!("SELECT id, {select} FROM {} ORDER BY id", collection.table),
        };
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = match &filter {
                Some((_, value)) => stmt.query(params![value])?,
                None => stmt.query([])?,
            };
            while let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let text: String = row.get(1)?;
                visit(decode(collection, &id, &text)?)?;
            }
            Ok(())
        })
    }

    /// Read, match and rewrite one document atomically. `apply` returns
    /// whether the document matched; unmatched documents are left untouched.
    fn modify_doc<T: Serialize + DeserializeOwned>(
        &self,
        collection: Collection,
        id: String,
        apply: impl FnOnce(&mut T) -> bool,
    ) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let text: Option<String> = tx
                .query_row(
                    &format!("SELECT doc FROM {} WHERE id = ?1", collection.table),
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(text) = text else {
                return Ok(false);
            };
            let mut doc: T = decode(collection, &id, &text)?;
            if !apply(&mut doc) {
                return Ok(false);
            }
            tx.execute(
                &format!("UPDATE {} SET doc = ?2 WHERE id = ?1", collection.table),
                params![id, encode(collection, &doc)?],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }
}

fn app_select(projection: AppProjection) -> &'static str {
    match projection {
        AppProjection::Full => "doc",
        AppProjection::Inventory => "json_remove(doc, '$.pending_op_groups')",
        AppProjection::Operations => "json_remove(doc, '$.group_instances', '$.ssh_keys')",
    }
}

impl DocumentStore for SqliteStore {
    fn put_owner(&self, owner: &Owner) -> Result<(), StoreError> {
        self.put_doc(OWNERS, owner.id.to_string(), &[], owner)
    }

    fn find_owner(&self, id: &OwnerId) -> Result<Option<Owner>, StoreError> {
        self.find_doc(OWNERS, id.to_string(), "doc")
    }

    fn scan_owners(
        &self,
        visit: &mut dyn FnMut(Owner) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        self.scan_docs(OWNERS, "doc", None, visit)
    }

    fn set_consumed_gears(&self, id: &OwnerId, value: u32) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE owners SET doc = json_set(doc, '$.consumed_gears', ?2) WHERE id = ?1",
                params![id.to_string(), value],
            )?;
            Ok(changed > 0)
        })
    }

    fn put_domain(&self, domain: &Domain) -> Result<(), StoreError> {
        self.put_doc(
            DOMAINS,
            domain.id.to_string(),
            &[("owner_id", domain.owner_id.to_string())],
            domain,
        )
    }

    fn find_domain(&self, id: &DomainId) -> Result<Option<Domain>, StoreError> {
        self.find_doc(DOMAINS, id.to_string(), "doc")
    }

    fn scan_domains(
        &self,
        visit: &mut dyn FnMut(Domain) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        self.scan_docs(DOMAINS, "doc", None, visit)
    }

    fn put_application(&self, app: &Application) -> Result<(), StoreError> {
        self.put_doc(
            APPLICATIONS,
            app.id.to_string(),
            &[
                ("domain_id", app.domain_id.to_string()),
                ("owner_id", app.owner_id.to_string()),
            ],
            app,
        )
    }

    fn delete_application(&self, id: &AppId) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed =
                conn.execute("DELETE FROM applications WHERE id = ?1", params![id.to_string()])?;
            Ok(changed > 0)
        })
    }

    fn find_application(
        &self,
        id: &AppId,
        projection: AppProjection,
    ) -> Result<Option<Application>, StoreError> {
        self.find_doc(APPLICATIONS, id.to_string(), app_select(projection))
    }

    fn scan_applications(
        &self,
        projection: AppProjection,
        visit: &mut dyn FnMut(Application) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        self.scan_docs(APPLICATIONS, app_select(projection), None, visit)
    }

    fn applications_in_domain(
        &self,
        domain: &DomainId,
        projection: AppProjection,
    ) -> Result<Vec<Application>, StoreError> {
        let mut apps = Vec::new();
        self.scan_docs(
            APPLICATIONS,
            app_select(projection),
            Some(("domain_id", domain.to_string())),
            &mut |app| {
                apps.push(app);
                Ok(())
            },
        )?;
        Ok(apps)
    }

    fn update_op_record(&self, slot: &OpSlot, update: &OpUpdate) -> Result<bool, StoreError> {
        self.modify_doc(APPLICATIONS, slot.app_id.to_string(), |app: &mut Application| {
            apply_op_update(app, slot, update)
        })
    }

    fn push_op_record(
        &self,
        slot: &GroupSlot,
        record: &OperationRecord,
    ) -> Result<bool, StoreError> {
        self.modify_doc(APPLICATIONS, slot.app_id.to_string(), |app: &mut Application| {
            apply_push_record(app, slot, record)
        })
    }

    fn push_op_group(&self, app: &AppId, group: &OperationGroup) -> Result<bool, StoreError> {
        self.modify_doc(APPLICATIONS, app.to_string(), |app: &mut Application| {
            app.pending_op_groups.push(group.clone());
            true
        })
    }

    fn pull_finished_op_group(&self, slot: &GroupSlot) -> Result<bool, StoreError> {
        self.modify_doc(APPLICATIONS, slot.app_id.to_string(), |app: &mut Application| {
            apply_pull_finished_group(app, slot)
        })
    }

    fn put_district(&self, district: &District) -> Result<(), StoreError> {
        self.put_doc(DISTRICTS, district.id.to_string(), &[], district)
    }

    fn find_district(&self, id: &DistrictId) -> Result<Option<District>, StoreError> {
        self.find_doc(DISTRICTS, id.to_string(), "doc")
    }

    fn scan_districts(
        &self,
        visit: &mut dyn FnMut(District) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        self.scan_docs(DISTRICTS, "doc", None, visit)
    }

    fn remove_available_uid(&self, id: &DistrictId, uid: u32) -> Result<bool, StoreError> {
        self.modify_doc(DISTRICTS, id.to_string(), |district: &mut District| {
            district.available_uids.remove(&uid)
        })
    }

    fn add_available_uid(&self, id: &DistrictId, uid: u32) -> Result<bool, StoreError> {
        self.modify_doc(DISTRICTS, id.to_string(), |district: &mut District| {
            district.available_uids.insert(uid)
        })
    }

    fn try_lock(&self, key: &str, now: WallClock, expires: WallClock) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT INTO locks (key, locked, timeout_ms) VALUES (?1, 1, ?2)
                 ON CONFLICT(key) DO UPDATE SET locked = 1, timeout_ms = excluded.timeout_ms
                 WHERE locks.locked = 0 OR locks.timeout_ms <= ?3",
                params![key, expires.0 as i64, now.0 as i64],
            )?;
            Ok(changed > 0)
        })
    }

    fn unlock(&self, key: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute("UPDATE locks SET locked = 0 WHERE key = ?1", params![key])?;
            Ok(())
        })
    }

    fn find_lock(&self, key: &str) -> Result<Option<LockRecord>, StoreError> {
        self.with_conn(|conn| {
            let record = conn
                .query_row(
                    "SELECT key, locked, timeout_ms FROM locks WHERE key = ?1",
                    params![key],
                    |row| {
                        Ok(LockRecord {
                            key: row.get(0)?,
                            locked: row.get::<_, i64>(1)? != 0,
                            timeout: WallClock(row.get::<_, i64>(2)?.max(0) as u64),
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
    }
}

fn encode<T: Serialize>(collection: Collection, doc: &T) -> Result<String, StoreError> {
    serde_json::to_string(doc).map_err(|source| StoreError::Encode {
        collection: collection.name,
        source,
    })
}

fn decode<T: DeserializeOwned>(
    collection: Collection,
    id: &str,
    text: &str,
) -> Result<T, StoreError> {
    serde_json::from_str(text).map_err(|source| StoreError::DocumentCorrupt {
        collection: collection.name,
        id: id.to_string(),
        source,
    })
}

fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS owners (
           id TEXT PRIMARY KEY,
           doc TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS domains (
           id TEXT PRIMARY KEY,
           owner_id TEXT NOT NULL,
           doc TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS domains_by_owner ON domains (owner_id);
         CREATE TABLE IF NOT EXISTS applications (
           id TEXT PRIMARY KEY,
           domain_id TEXT NOT NULL,
           owner_id TEXT NOT NULL,
           doc TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS applications_by_domain ON applications (domain_id);
         CREATE TABLE IF NOT EXISTS districts (
           id TEXT PRIMARY KEY,
           doc TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS locks (
           key TEXT PRIMARY KEY,
           locked INTEGER NOT NULL,
           timeout_ms INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS meta (
           key TEXT PRIMARY KEY,
           value TEXT NOT NULL
         );",
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES ('store_schema_version', ?1)",
        params![STORE_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

fn validate_schema_version(conn: &Connection) -> Result<(), StoreError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = 'store_schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    let got = raw.and_then(|raw| raw.parse::<u32>().ok()).unwrap_or(0);
    if got != STORE_SCHEMA_VERSION {
        return Err(StoreError::SchemaVersionMismatch {
            expected: STORE_SCHEMA_VERSION,
            got,
        });
    }
    Ok(())
}

fn table_exists(conn: &Connection, name: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn ensure_permissions(path: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(
            |source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            },
        )?;
    }
    Ok(())
}

fn reject_symlink(path: &Path) -> Result<(), StoreError> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => Err(StoreError::Symlink {
            path: path.to_path_buf(),
        }),
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source: err,
        }),
    }
}

fn open_connection(path: &Path, create: bool) -> Result<Connection, StoreError> {
    let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE;
    if create {
        flags |= OpenFlags::SQLITE_OPEN_CREATE;
    }
    let conn = Connection::open_with_flags(path, flags)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS))?;
    Ok(conn)
}
