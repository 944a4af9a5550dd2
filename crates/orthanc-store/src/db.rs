use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use orthanc_core::{
    ChangeKind, CompressionType, DicomTag, IdentifierConstraint, InternalId, MetadataKind,
    PublicId, ResourceLevel, TagValue,
};

use crate::error::StoreError;

const SCHEMA_VERSION: u32 = 1;

// Idempotent DDL, run once at open(). Mirrors the logical layout in full —
// one table per spec entity, no normalization beyond what's named there.
const MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS Resources (
    internalId   INTEGER PRIMARY KEY AUTOINCREMENT,
    resourceType INTEGER NOT NULL,
    publicId     TEXT NOT NULL UNIQUE,
    parentId     INTEGER NULL REFERENCES Resources(internalId)
);
CREATE INDEX IF NOT EXISTS idx_resources_parent ON Resources(parentId);

CREATE TABLE IF NOT EXISTS MainDicomTags (
    id      INTEGER NOT NULL REFERENCES Resources(internalId),
    "group" INTEGER NOT NULL,
    element INTEGER NOT NULL,
    value   TEXT NOT NULL,
    UNIQUE(id, "group", element)
);

CREATE TABLE IF NOT EXISTS DicomIdentifiers (
    id      INTEGER NOT NULL REFERENCES Resources(internalId),
    "group" INTEGER NOT NULL,
    element INTEGER NOT NULL,
    value   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_dicom_identifiers_tag ON DicomIdentifiers("group", element, value);

CREATE TABLE IF NOT EXISTS Metadata (
    id    INTEGER NOT NULL REFERENCES Resources(internalId),
    type  TEXT NOT NULL,
    value TEXT NOT NULL,
    UNIQUE(id, type)
);

CREATE TABLE IF NOT EXISTS AttachedFiles (
    id               INTEGER NOT NULL REFERENCES Resources(internalId),
    fileType         INTEGER NOT NULL,
    uuid             TEXT NOT NULL,
    compressedSize   INTEGER NOT NULL,
    uncompressedSize INTEGER NOT NULL,
    compressionType  INTEGER NOT NULL,
    uncompressedMD5  TEXT NOT NULL,
    compressedMD5    TEXT NOT NULL,
    UNIQUE(id, fileType)
);

CREATE TABLE IF NOT EXISTS GlobalProperties (
    property TEXT PRIMARY KEY,
    value    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS Changes (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    changeType TEXT NOT NULL,
    internalId INTEGER NOT NULL,
    resourceType INTEGER NOT NULL,
    date       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ExportedResources (
    seq          INTEGER PRIMARY KEY AUTOINCREMENT,
    resourceType INTEGER NOT NULL,
    publicId     TEXT NOT NULL,
    modality     TEXT NOT NULL,
    patientId    TEXT NOT NULL,
    studyUid     TEXT NOT NULL,
    seriesUid    TEXT NOT NULL,
    sopUid       TEXT NOT NULL,
    date         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS PatientRecyclingOrder (
    seq       INTEGER PRIMARY KEY AUTOINCREMENT,
    patientId INTEGER NOT NULL UNIQUE
);
"#;

fn level_code(level: ResourceLevel) -> i64 {
    match level {
        ResourceLevel::Patient => 0,
        ResourceLevel::Study => 1,
        ResourceLevel::Series => 2,
        ResourceLevel::Instance => 3,
    }
}

fn code_level(code: i64) -> ResourceLevel {
    match code {
        0 => ResourceLevel::Patient,
        1 => ResourceLevel::Study,
        2 => ResourceLevel::Series,
        _ => ResourceLevel::Instance,
    }
}

/// What a deletion actually did, returned rather than fired as callbacks so
/// the caller can apply storage-area side effects after the transaction that
/// produced this outcome has committed.
#[derive(Debug, Default)]
pub struct DeleteOutcome {
    pub deleted_changes: Vec<PublicId>,
    pub file_deleted: Vec<(String, CompressionType)>,
    /// The deleted resource's parent, but only when it was left with zero
    /// remaining children (IV2). `None` when a sibling survives or the
    /// deleted resource was a root patient.
    pub remaining_ancestor: Option<(ResourceLevel, PublicId)>,
}

/// The outcome of `store()`'s public-id uniqueness probe and insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreStatus {
    Success,
    AlreadyStored,
}

/// A single row appended to `AttachedFiles` by the caller (Resource Index),
/// already carrying the uuid the storage area was asked to create.
pub struct NewAttachment {
    pub file_type: i64,
    pub uuid: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub compression: CompressionType,
    pub uncompressed_md5: String,
    pub compressed_md5: String,
}

/// Transactional wrapper around an embedded SQLite connection. Every public
/// method takes the mutex for its whole duration — this is the "Database
/// mutex (D)" of the concurrency model; callers never hold it across a call
/// into the storage area or the registry.
pub struct DbWrapper {
    conn: Mutex<Connection>,
}

impl DbWrapper {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(MIGRATIONS)?;
        let wrapper = DbWrapper { conn: Mutex::new(conn) };
        wrapper.check_or_set_schema_version()?;
        Ok(wrapper)
    }

    fn check_or_set_schema_version(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<String> = conn
            .query_row(
                "SELECT value FROM GlobalProperties WHERE property = 'SchemaVersion'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match existing {
            None => {
                conn.execute(
                    "INSERT INTO GlobalProperties(property, value) VALUES ('SchemaVersion', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
                Ok(())
            }
            Some(v) => {
                let found: u32 = v.parse().unwrap_or(0);
                if found > SCHEMA_VERSION {
                    Err(StoreError::SchemaTooNew { found, supported: SCHEMA_VERSION })
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Look up a resource's internal id from its public id, if it exists.
    pub fn lookup_resource(&self, public_id: &PublicId) -> Result<Option<InternalId>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let id: Option<i64> = conn
            .query_row(
                "SELECT internalId FROM Resources WHERE publicId = ?1",
                params![public_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(InternalId::new))
    }

    /// The parent internal id of an existing resource, if any.
    pub fn parent_of(&self, id: InternalId) -> Result<Option<InternalId>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let parent: Option<i64> = conn.query_row(
            "SELECT parentId FROM Resources WHERE internalId = ?1",
            params![id.0],
            |row| row.get(0),
        )?;
        Ok(parent.map(InternalId::new))
    }

    /// Create a resource row if one does not already exist for `public_id`;
    /// returns its internal id either way (IV3: public ids are never reused
    /// or re-inserted).
    pub fn create_resource_if_absent(
        &self,
        level: ResourceLevel,
        public_id: &PublicId,
        parent: Option<InternalId>,
    ) -> Result<(InternalId, StoreStatus), StoreError> {
        let conn = self.conn.lock().unwrap();
        if let Some(id) = conn
            .query_row(
                "SELECT internalId FROM Resources WHERE publicId = ?1",
                params![public_id.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?
        {
            return Ok((InternalId::new(id), StoreStatus::AlreadyStored));
        }
        conn.execute(
            "INSERT INTO Resources(resourceType, publicId, parentId) VALUES (?1, ?2, ?3)",
            params![level_code(level), public_id.as_str(), parent.map(|p| p.0)],
        )?;
        let id = conn.last_insert_rowid();
        self.append_change_locked(&conn, ChangeKind::new_for(level), id, level)?;
        Ok((InternalId::new(id), StoreStatus::Success))
    }

    pub fn set_main_dicom_tag(&self, id: InternalId, tag: DicomTag, value: &TagValue) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let text = value.as_str().unwrap_or_default();
        conn.execute(
            "INSERT INTO MainDicomTags(id, \"group\", element, value) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id, \"group\", element) DO UPDATE SET value = excluded.value",
            params![id.0, tag.group(), tag.element(), text],
        )?;
        Ok(())
    }

    pub fn set_identifier_tag(&self, id: InternalId, tag: DicomTag, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO DicomIdentifiers(id, \"group\", element, value) VALUES (?1, ?2, ?3, ?4)",
            params![id.0, tag.group(), tag.element(), value],
        )?;
        Ok(())
    }

    pub fn set_metadata(&self, id: InternalId, kind: MetadataKind, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO Metadata(id, type, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(id, type) DO UPDATE SET value = excluded.value",
            params![id.0, kind.to_string(), value],
        )?;
        Ok(())
    }

    pub fn add_attachment(&self, id: InternalId, attachment: &NewAttachment) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO AttachedFiles(id, fileType, uuid, compressedSize, uncompressedSize,
                compressionType, uncompressedMD5, compressedMD5)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.0,
                attachment.file_type,
                attachment.uuid,
                attachment.compressed_size as i64,
                attachment.uncompressed_size as i64,
                compression_code(attachment.compression),
                attachment.uncompressed_md5,
                attachment.compressed_md5,
            ],
        )?;
        Ok(())
    }

    /// Delete `public_id` and every descendant, returning the signals the
    /// caller must act on once this transaction is known to have committed.
    pub fn delete_resource(&self, public_id: &PublicId) -> Result<DeleteOutcome, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut outcome = DeleteOutcome::default();

        let root: Option<(i64, i64, Option<i64>)> = tx
            .query_row(
                "SELECT internalId, resourceType, parentId FROM Resources WHERE publicId = ?1",
                params![public_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((root_id, _root_type, parent_id)) = root else {
            tx.commit()?;
            return Ok(outcome);
        };

        let mut stack = vec![root_id];
        let mut to_delete = Vec::new();
        while let Some(id) = stack.pop() {
            to_delete.push(id);
            let mut stmt = tx.prepare("SELECT internalId FROM Resources WHERE parentId = ?1")?;
            let children = stmt.query_map(params![id], |row| row.get::<_, i64>(0))?;
            for child in children {
                stack.push(child?);
            }
        }

        for id in &to_delete {
            let mut stmt = tx.prepare("SELECT uuid, compressionType FROM AttachedFiles WHERE id = ?1")?;
            let rows = stmt.query_map(params![id], |row| {
                let uuid: String = row.get(0)?;
                let kind: i64 = row.get(1)?;
                Ok((uuid, kind))
            })?;
            for row in rows {
                let (uuid, kind) = row?;
                outcome.file_deleted.push((uuid, code_compression(kind)));
            }

            let (public, rtype): (String, i64) = tx.query_row(
                "SELECT publicId, resourceType FROM Resources WHERE internalId = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            outcome.deleted_changes.push(PublicId(public));
            append_change(&tx, ChangeKind::Deleted, *id, code_level(rtype))?;

            tx.execute("DELETE FROM AttachedFiles WHERE id = ?1", params![id])?;
            tx.execute("DELETE FROM Metadata WHERE id = ?1", params![id])?;
            tx.execute("DELETE FROM DicomIdentifiers WHERE id = ?1", params![id])?;
            tx.execute("DELETE FROM MainDicomTags WHERE id = ?1", params![id])?;
            tx.execute("DELETE FROM Resources WHERE internalId = ?1", params![id])?;
        }

        if let Some(parent) = parent_id {
            // The deleted subtree's rows are already gone at this point, so a
            // straight count reflects surviving children (IV2/P2): notify
            // only when the parent has none left, not merely because it
            // still exists.
            let remaining_children: i64 = tx.query_row(
                "SELECT COUNT(*) FROM Resources WHERE parentId = ?1",
                params![parent],
                |row| row.get(0),
            )?;
            if remaining_children == 0 {
                let (public, rtype): (String, i64) = tx.query_row(
                    "SELECT publicId, resourceType FROM Resources WHERE internalId = ?1",
                    params![parent],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                outcome.remaining_ancestor = Some((code_level(rtype), PublicId(public)));
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    pub fn lookup_identifier(
        &self,
        level: ResourceLevel,
        tag: DicomTag,
        constraint: &IdentifierConstraint,
    ) -> Result<Vec<PublicId>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let (clause, bound) = match constraint {
            IdentifierConstraint::Equal(v) => ("value = ?4", v.clone()),
            IdentifierConstraint::GreaterOrEqual(v) => ("value >= ?4", v.clone()),
            IdentifierConstraint::SmallerOrEqual(v) => ("value <= ?4", v.clone()),
            IdentifierConstraint::Wildcard(v) => (
                "value LIKE ?4 ESCAPE '\\'",
                IdentifierConstraint::wildcard_to_like(v),
            ),
        };
        let sql = format!(
            "SELECT r.publicId FROM DicomIdentifiers di
             JOIN Resources r ON r.internalId = di.id
             WHERE r.resourceType = ?1 AND di.\"group\" = ?2 AND di.element = ?3 AND {clause}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![level_code(level), tag.group(), tag.element(), bound],
            |row| row.get::<_, String>(0),
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(PublicId(row?));
        }
        Ok(out)
    }

    pub fn get_statistics(&self) -> Result<Statistics, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count_of = |rtype: i64| -> rusqlite::Result<i64> {
            conn.query_row(
                "SELECT COUNT(*) FROM Resources WHERE resourceType = ?1",
                params![rtype],
                |row| row.get(0),
            )
        };
        let total_uncompressed: i64 = conn.query_row(
            "SELECT COALESCE(SUM(uncompressedSize), 0) FROM AttachedFiles",
            [],
            |row| row.get(0),
        )?;
        let total_compressed: i64 = conn.query_row(
            "SELECT COALESCE(SUM(compressedSize), 0) FROM AttachedFiles",
            [],
            |row| row.get(0),
        )?;
        Ok(Statistics {
            patients: count_of(0)? as u64,
            studies: count_of(1)? as u64,
            series: count_of(2)? as u64,
            instances: count_of(3)? as u64,
            total_uncompressed_size: total_uncompressed as u64,
            total_compressed_size: total_compressed as u64,
        })
    }

    /// Whether `patient_id` is currently protected from recycling, i.e.
    /// absent from the recycling queue (IV4).
    pub fn is_protected(&self, patient_id: InternalId) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let present: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM PatientRecyclingOrder WHERE patientId = ?1",
                params![patient_id.0],
                |row| row.get(0),
            )
            .optional()?;
        Ok(present.is_none())
    }

    /// Append a change row directly, for signals the wrapper itself doesn't
    /// derive from a mutation (e.g. the Resource Index's cross-patient
    /// inconsistency flag).
    pub fn record_change(&self, kind: ChangeKind, internal_id: InternalId, level: ResourceLevel) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        append_change(&conn, kind, internal_id.0, level)
    }

    pub fn select_patient_to_recycle(&self, avoid: Option<InternalId>) -> Result<Option<PublicId>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT r.publicId FROM PatientRecyclingOrder pro
             JOIN Resources r ON r.internalId = pro.patientId
             ORDER BY pro.seq ASC",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        for row in rows {
            let public = row?;
            let internal = conn.query_row(
                "SELECT internalId FROM Resources WHERE publicId = ?1",
                params![public],
                |r| r.get::<_, i64>(0),
            )?;
            if Some(InternalId::new(internal)) != avoid {
                return Ok(Some(PublicId(public)));
            }
        }
        Ok(None)
    }

    pub fn register_for_recycling(&self, patient_id: InternalId) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO PatientRecyclingOrder(patientId) VALUES (?1)",
            params![patient_id.0],
        )?;
        Ok(())
    }

    pub fn protect_from_recycling(&self, patient_id: InternalId) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM PatientRecyclingOrder WHERE patientId = ?1",
            params![patient_id.0],
        )?;
        Ok(())
    }

    pub fn record_export(
        &self,
        level: ResourceLevel,
        public_id: &PublicId,
        modality: &str,
        patient_id: &str,
        study_uid: &str,
        series_uid: &str,
        sop_uid: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO ExportedResources(resourceType, publicId, modality, patientId, studyUid, seriesUid, sopUid, date)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                level_code(level),
                public_id.as_str(),
                modality,
                patient_id,
                study_uid,
                series_uid,
                sop_uid,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_changes(&self, since: i64, limit: u32) -> Result<(Vec<ChangeRow>, bool), StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT seq, changeType, internalId, resourceType, date, publicId
             FROM Changes c JOIN Resources r ON r.internalId = c.internalId
             WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since, (limit as i64) + 1], |row| {
            Ok(ChangeRow {
                seq: row.get(0)?,
                change_type: row.get(1)?,
                public_id: PublicId(row.get(5)?),
                resource_type: code_level(row.get(3)?),
                date: row.get(4)?,
            })
        })?;
        let mut out: Vec<ChangeRow> = rows.collect::<rusqlite::Result<_>>()?;
        let done = out.len() <= limit as usize;
        out.truncate(limit as usize);
        Ok((out, done))
    }

    pub fn get_exported_resources(&self, since: i64, limit: u32) -> Result<(Vec<ExportRow>, bool), StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT seq, resourceType, publicId, modality, patientId, studyUid, seriesUid, sopUid, date
             FROM ExportedResources WHERE seq > ?1 ORDER BY seq ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since, (limit as i64) + 1], |row| {
            Ok(ExportRow {
                seq: row.get(0)?,
                resource_type: code_level(row.get(1)?),
                public_id: PublicId(row.get(2)?),
                modality: row.get(3)?,
                patient_id: row.get(4)?,
                study_uid: row.get(5)?,
                series_uid: row.get(6)?,
                sop_uid: row.get(7)?,
                date: row.get(8)?,
            })
        })?;
        let mut out: Vec<ExportRow> = rows.collect::<rusqlite::Result<_>>()?;
        let done = out.len() <= limit as usize;
        out.truncate(limit as usize);
        Ok((out, done))
    }

    fn append_change_locked(&self, conn: &Connection, kind: ChangeKind, internal_id: i64, level: ResourceLevel) -> Result<(), StoreError> {
        append_change(conn, kind, internal_id, level)
    }

    /// Re-parent an existing child row. Used only by the cross-patient
    /// consistency path in the index — `create_resource_if_absent` already
    /// sets the parent at insert time for the common case.
    pub fn attach_child(&self, parent_id: InternalId, child_id: InternalId) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE Resources SET parentId = ?1 WHERE internalId = ?2",
            params![parent_id.0, child_id.0],
        )?;
        Ok(())
    }

    pub fn lookup_metadata(&self, id: InternalId, kind: MetadataKind) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM Metadata WHERE id = ?1 AND type = ?2",
                params![id.0, kind.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn delete_metadata(&self, id: InternalId, kind: MetadataKind) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM Metadata WHERE id = ?1 AND type = ?2",
            params![id.0, kind.to_string()],
        )?;
        Ok(())
    }

    /// The metadata kinds currently set on a resource, in no particular order.
    pub fn list_available_metadata(&self, id: InternalId) -> Result<Vec<MetadataKind>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT type FROM Metadata WHERE id = ?1")?;
        let rows = stmt.query_map(params![id.0], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            if let Ok(kind) = row?.parse::<MetadataKind>() {
                out.push(kind);
            }
        }
        Ok(out)
    }

    pub fn get_all_metadata(&self, id: InternalId) -> Result<Vec<(MetadataKind, String)>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT type, value FROM Metadata WHERE id = ?1")?;
        let rows = stmt.query_map(params![id.0], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (kind, value) = row?;
            if let Ok(kind) = kind.parse::<MetadataKind>() {
                out.push((kind, value));
            }
        }
        Ok(out)
    }

    pub fn lookup_attachment(&self, id: InternalId, file_type: i64) -> Result<Option<AttachmentRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT uuid, compressedSize, uncompressedSize, compressionType, uncompressedMD5, compressedMD5
             FROM AttachedFiles WHERE id = ?1 AND fileType = ?2",
            params![id.0, file_type],
            |row| {
                Ok(AttachmentRow {
                    uuid: row.get(0)?,
                    compressed_size: row.get::<_, i64>(1)? as u64,
                    uncompressed_size: row.get::<_, i64>(2)? as u64,
                    compression: code_compression(row.get(3)?),
                    uncompressed_md5: row.get(4)?,
                    compressed_md5: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn delete_attachment(&self, id: InternalId, file_type: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM AttachedFiles WHERE id = ?1 AND fileType = ?2",
            params![id.0, file_type],
        )?;
        Ok(())
    }

    pub fn list_available_attachments(&self, id: InternalId) -> Result<Vec<i64>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT fileType FROM AttachedFiles WHERE id = ?1")?;
        let rows = stmt.query_map(params![id.0], |row| row.get::<_, i64>(0))?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// Rows whose stored value falls within `[start, end]` under SQLite's
    /// default text collation — used for date/time range C-FIND matching.
    pub fn lookup_identifier_range(
        &self,
        level: ResourceLevel,
        tag: DicomTag,
        start: &str,
        end: &str,
    ) -> Result<Vec<PublicId>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT r.publicId FROM DicomIdentifiers di
             JOIN Resources r ON r.internalId = di.id
             WHERE r.resourceType = ?1 AND di.\"group\" = ?2 AND di.element = ?3
               AND di.value >= ?4 AND di.value <= ?5",
        )?;
        let rows = stmt.query_map(
            params![level_code(level), tag.group(), tag.element(), start, end],
            |row| row.get::<_, String>(0),
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(PublicId(row?));
        }
        Ok(out)
    }

    pub fn get_last_change(&self) -> Result<Option<ChangeRow>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT seq, changeType, internalId, resourceType, date, publicId
             FROM Changes c JOIN Resources r ON r.internalId = c.internalId
             ORDER BY seq DESC LIMIT 1",
            [],
            |row| {
                Ok(ChangeRow {
                    seq: row.get(0)?,
                    change_type: row.get(1)?,
                    public_id: PublicId(row.get(5)?),
                    resource_type: code_level(row.get(3)?),
                    date: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(StoreError::from)
    }

    pub fn set_global_property(&self, kind: i64, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO GlobalProperties(property, value) VALUES (?1, ?2)
             ON CONFLICT(property) DO UPDATE SET value = excluded.value",
            params![format!("Custom{kind}"), value],
        )?;
        Ok(())
    }

    pub fn lookup_global_property(&self, kind: i64) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM GlobalProperties WHERE property = ?1",
                params![format!("Custom{kind}")],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Monotonic, persisted. Reads-modifies-writes under the same mutex
    /// guard the rest of the wrapper's writers take, so concurrent callers
    /// never observe the same next value twice.
    pub fn increment_global_sequence(&self, kind: i64) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let property = format!("Sequence{kind}");
        let current: Option<String> = conn
            .query_row(
                "SELECT value FROM GlobalProperties WHERE property = ?1",
                params![property],
                |row| row.get(0),
            )
            .optional()?;
        let next = current.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0) + 1;
        conn.execute(
            "INSERT INTO GlobalProperties(property, value) VALUES (?1, ?2)
             ON CONFLICT(property) DO UPDATE SET value = excluded.value",
            params![property, next.to_string()],
        )?;
        Ok(next)
    }

    /// Idempotent: protecting an already-protected patient (or unprotecting
    /// an already-unprotected one) is a no-op, per IV4.
    pub fn set_protected(&self, patient_id: InternalId, protected: bool) -> Result<(), StoreError> {
        if protected {
            self.protect_from_recycling(patient_id)
        } else {
            self.register_for_recycling(patient_id)
        }
    }

    /// Runs every forward migration registered for a version strictly
    /// greater than the schema version found at open time, in order. The
    /// migration table is frozen after this module is compiled — there is
    /// no runtime registration surface (spec.md §9 "global mutable state").
    pub fn upgrade(&self, target_version: u32) -> Result<(), StoreError> {
        const MIGRATIONS_BY_VERSION: &[(u32, fn(&Connection) -> rusqlite::Result<()>)] = &[];
        let conn = self.conn.lock().unwrap();
        let current: u32 = conn
            .query_row(
                "SELECT value FROM GlobalProperties WHERE property = 'SchemaVersion'",
                [],
                |row| row.get::<_, String>(0),
            )?
            .parse()
            .unwrap_or(0);
        for (version, migration) in MIGRATIONS_BY_VERSION {
            if *version > current && *version <= target_version {
                migration(&conn)?;
            }
        }
        conn.execute(
            "UPDATE GlobalProperties SET value = ?1 WHERE property = 'SchemaVersion'",
            params![target_version.max(current).to_string()],
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AttachmentRow {
    pub uuid: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub compression: CompressionType,
    pub uncompressed_md5: String,
    pub compressed_md5: String,
}

fn append_change(conn: &Connection, kind: ChangeKind, internal_id: i64, level: ResourceLevel) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO Changes(changeType, internalId, resourceType, date) VALUES (?1, ?2, ?3, ?4)",
        params![kind.to_string(), internal_id, level_code(level), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn compression_code(c: CompressionType) -> i64 {
    match c {
        CompressionType::None => 0,
        CompressionType::ZlibWithSizePrefix => 1,
    }
}

fn code_compression(code: i64) -> CompressionType {
    match code {
        1 => CompressionType::ZlibWithSizePrefix,
        _ => CompressionType::None,
    }
}

trait ChangeKindExt {
    fn new_for(level: ResourceLevel) -> ChangeKind;
}

impl ChangeKindExt for ChangeKind {
    fn new_for(level: ResourceLevel) -> ChangeKind {
        match level {
            ResourceLevel::Patient => ChangeKind::NewPatient,
            ResourceLevel::Study => ChangeKind::NewStudy,
            ResourceLevel::Series => ChangeKind::NewSeries,
            ResourceLevel::Instance => ChangeKind::NewInstance,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChangeRow {
    pub seq: i64,
    pub change_type: String,
    pub public_id: PublicId,
    pub resource_type: ResourceLevel,
    pub date: String,
}

#[derive(Debug, Clone)]
pub struct ExportRow {
    pub seq: i64,
    pub resource_type: ResourceLevel,
    pub public_id: PublicId,
    pub modality: String,
    pub patient_id: String,
    pub study_uid: String,
    pub series_uid: String,
    pub sop_uid: String,
    pub date: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Statistics {
    pub patients: u64,
    pub studies: u64,
    pub series: u64,
    pub instances: u64,
    pub total_uncompressed_size: u64,
    pub total_compressed_size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_mem() -> DbWrapper {
        DbWrapper::open(":memory:").unwrap()
    }

    #[test]
    fn creating_same_public_id_twice_is_idempotent() {
        let db = open_mem();
        let pid = PublicId::compute(ResourceLevel::Patient, &["P1"]);
        let (id1, status1) = db.create_resource_if_absent(ResourceLevel::Patient, &pid, None).unwrap();
        let (id2, status2) = db.create_resource_if_absent(ResourceLevel::Patient, &pid, None).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(status1, StoreStatus::Success);
        assert_eq!(status2, StoreStatus::AlreadyStored);
    }

    #[test]
    fn deleting_a_patient_cascades_to_its_descendants() {
        let db = open_mem();
        let patient = PublicId::compute(ResourceLevel::Patient, &["P1"]);
        let (pid, _) = db.create_resource_if_absent(ResourceLevel::Patient, &patient, None).unwrap();
        let study = PublicId::compute(ResourceLevel::Study, &["P1", "S1"]);
        let (sid, _) = db.create_resource_if_absent(ResourceLevel::Study, &study, Some(pid)).unwrap();
        db.add_attachment(
            sid,
            &NewAttachment {
                file_type: 1,
                uuid: "abc".into(),
                compressed_size: 1,
                uncompressed_size: 1,
                compression: CompressionType::None,
                uncompressed_md5: "x".into(),
                compressed_md5: "x".into(),
            },
        )
        .unwrap();

        let outcome = db.delete_resource(&patient).unwrap();
        assert_eq!(outcome.deleted_changes.len(), 2);
        assert_eq!(outcome.file_deleted.len(), 1);
        assert!(db.lookup_resource(&patient).unwrap().is_none());
        assert!(db.lookup_resource(&study).unwrap().is_none());
    }

    #[test]
    fn deleting_one_of_two_sibling_series_reports_no_remaining_ancestor() {
        let db = open_mem();
        let patient = PublicId::compute(ResourceLevel::Patient, &["P1"]);
        let (pid, _) = db.create_resource_if_absent(ResourceLevel::Patient, &patient, None).unwrap();
        let study = PublicId::compute(ResourceLevel::Study, &["P1", "S1"]);
        let (sid, _) = db.create_resource_if_absent(ResourceLevel::Study, &study, Some(pid)).unwrap();
        let series_a = PublicId::compute(ResourceLevel::Series, &["P1", "S1", "SE1"]);
        db.create_resource_if_absent(ResourceLevel::Series, &series_a, Some(sid)).unwrap();
        let series_b = PublicId::compute(ResourceLevel::Series, &["P1", "S1", "SE2"]);
        db.create_resource_if_absent(ResourceLevel::Series, &series_b, Some(sid)).unwrap();

        let outcome = db.delete_resource(&series_a).unwrap();
        assert_eq!(outcome.remaining_ancestor, None);
        assert!(db.lookup_resource(&study).unwrap().is_some());

        let outcome = db.delete_resource(&series_b).unwrap();
        assert_eq!(outcome.remaining_ancestor, Some((ResourceLevel::Study, study.clone())));
    }

    #[test]
    fn wildcard_identifier_lookup_matches_sql_like_translation() {
        let db = open_mem();
        let patient = PublicId::compute(ResourceLevel::Patient, &["P1"]);
        let (pid, _) = db.create_resource_if_absent(ResourceLevel::Patient, &patient, None).unwrap();
        let tag = DicomTag(0x0010, 0x0020);
        db.set_identifier_tag(pid, tag, "PAT001").unwrap();

        let hits = db
            .lookup_identifier(ResourceLevel::Patient, tag, &IdentifierConstraint::Wildcard("PAT*".into()))
            .unwrap();
        assert_eq!(hits, vec![patient]);
    }

    #[test]
    fn changes_pagination_reports_done_when_fewer_rows_than_limit() {
        let db = open_mem();
        let patient = PublicId::compute(ResourceLevel::Patient, &["P1"]);
        db.create_resource_if_absent(ResourceLevel::Patient, &patient, None).unwrap();
        let (rows, done) = db.get_changes(0, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(done);
    }

    #[test]
    fn metadata_set_overwrites_and_deletes() {
        let db = open_mem();
        let patient = PublicId::compute(ResourceLevel::Patient, &["P1"]);
        let (pid, _) = db.create_resource_if_absent(ResourceLevel::Patient, &patient, None).unwrap();
        db.set_metadata(pid, MetadataKind::RemoteAet, "AET1").unwrap();
        db.set_metadata(pid, MetadataKind::RemoteAet, "AET2").unwrap();
        assert_eq!(db.lookup_metadata(pid, MetadataKind::RemoteAet).unwrap(), Some("AET2".to_string()));
        assert_eq!(db.list_available_metadata(pid).unwrap(), vec![MetadataKind::RemoteAet]);
        db.delete_metadata(pid, MetadataKind::RemoteAet).unwrap();
        assert_eq!(db.lookup_metadata(pid, MetadataKind::RemoteAet).unwrap(), None);
    }

    #[test]
    fn global_sequence_increments_monotonically_and_persists() {
        let db = open_mem();
        assert_eq!(db.increment_global_sequence(1).unwrap(), 1);
        assert_eq!(db.increment_global_sequence(1).unwrap(), 2);
        assert_eq!(db.increment_global_sequence(2).unwrap(), 1);
    }

    #[test]
    fn set_protected_is_idempotent_and_removes_from_recycling_order() {
        let db = open_mem();
        let patient = PublicId::compute(ResourceLevel::Patient, &["P1"]);
        let (pid, _) = db.create_resource_if_absent(ResourceLevel::Patient, &patient, None).unwrap();
        db.register_for_recycling(pid).unwrap();
        assert!(!db.is_protected(pid).unwrap());
        db.set_protected(pid, true).unwrap();
        db.set_protected(pid, true).unwrap();
        assert!(db.is_protected(pid).unwrap());
        assert_eq!(db.select_patient_to_recycle(None).unwrap(), None);
        db.set_protected(pid, false).unwrap();
        assert_eq!(db.select_patient_to_recycle(None).unwrap(), Some(patient));
    }

    #[test]
    fn identifier_range_lookup_includes_bounds_inclusive() {
        let db = open_mem();
        let patient = PublicId::compute(ResourceLevel::Patient, &["P1"]);
        let (pid, _) = db.create_resource_if_absent(ResourceLevel::Patient, &patient, None).unwrap();
        let tag = DicomTag(0x0008, 0x0020);
        db.set_identifier_tag(pid, tag, "20240101").unwrap();
        let hits = db
            .lookup_identifier_range(ResourceLevel::Patient, tag, "20240101", "20241231")
            .unwrap();
        assert_eq!(hits, vec![patient]);
    }
}
