//! Local data store access
//!
//! The sync engine reads pending rows, patients and blobs from the device
//! database and deletes or rewrites them after a successful upload. Table
//! names come from the catalog at runtime, so identifiers are validated
//! before being spliced into SQL.

use rusqlite::types::ValueRef;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;

use crate::error::{Result, SyncError};
use crate::models::{Patient, TaskRecord};

/// Primary key column every client table carries
pub const PK_FIELD: &str = "id";
/// Per-record "delete locally once uploaded" flag
pub const MOVE_OFF_FIELD: &str = "_move_off_device";
/// Last-modification timestamp column
pub const MODIFIED_FIELD: &str = "when_modified";
/// Foreign key from a task row to its patient, where one exists
pub const PATIENT_FK_FIELD: &str = "patient_id";

pub const PATIENT_TABLE: &str = "patient";
pub const PATIENT_IDNUM_TABLE: &str = "patient_idnum";
pub const BLOB_TABLE: &str = "blobs";

/// One pending row, ready for the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    /// Primary key value
    pub pk: i64,
    /// Last-modification timestamp, if the table records one
    pub when_modified: Option<String>,
    /// Per-record move-off flag
    pub move_off: bool,
    /// Column values in `field_names` order, `None` for SQL NULL
    pub values: Vec<Option<String>>,
}

/// Read/write operations the sync engine needs from the device database.
///
/// Implementations are synchronous; the orchestrator holds the store for the
/// whole session, so no other writer can move tables under the catalog.
pub trait LocalStore {
    /// Every client table eligible for upload, system tables included
    fn client_tables(&self) -> Result<Vec<String>>;

    fn row_count(&self, table: &str) -> Result<usize>;

    /// Column names for `table`, in declaration order
    fn field_names(&self, table: &str) -> Result<Vec<String>>;

    /// All rows of `table`, decoded for transmission
    fn rows(&self, table: &str) -> Result<Vec<StoredRow>>;

    fn pk_values(&self, table: &str) -> Result<Vec<i64>>;

    /// Does `table` reference a patient?
    fn has_patient_column(&self, table: &str) -> Result<bool>;

    /// Every patient on the device, with their assigned ID numbers
    fn patients(&self) -> Result<Vec<Patient>>;

    /// Task-level view of `table`'s rows (pk, owning patient, move-off flag)
    fn task_records(&self, table: &str) -> Result<Vec<TaskRecord>>;

    /// Delete specific rows; returns how many went
    fn delete_rows(&self, table: &str, pks: &[i64]) -> Result<usize>;

    /// Delete every row of `table` belonging to `patient_pk`
    fn delete_rows_for_patient(&self, table: &str, patient_pk: i64) -> Result<usize>;

    /// Delete every row of `table`
    fn wipe_table(&self, table: &str) -> Result<usize>;

    /// Reset the move-off flag on every row of `table`
    fn clear_move_off_flags(&self, table: &str) -> Result<usize>;

    /// Reset move-off flags on `table`, sparing rows owned by the listed
    /// patients so their pending move requests survive into the next session
    fn clear_move_off_flags_except(&self, table: &str, patient_pks: &[i64]) -> Result<usize>;

    /// Strip a retained patient down to identifying fields; returns 1 if the
    /// row needed changing
    fn reduce_patient_to_shell(&self, patient_pk: i64) -> Result<usize>;

    /// Delete blobs whose owning row no longer exists; returns how many went
    fn prune_dead_blobs(&self) -> Result<usize>;

    /// Approximate wire size of `table`'s pending rows, in bytes
    fn payload_bytes(&self, table: &str) -> Result<u64>;
}

/// `SQLite` implementation of [`LocalStore`]
pub struct SqliteStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteStore<'a> {
    /// Create a store over an open connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Reject anything that isn't a plain SQL identifier before it reaches
    /// string-built SQL.
    fn checked_identifier(name: &str) -> Result<&str> {
        let mut chars = name.chars();
        let valid = chars
            .next()
            .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
            && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
        if valid {
            Ok(name)
        } else {
            Err(SyncError::Config(format!(
                "invalid table or column name: {name:?}"
            )))
        }
    }

    fn decode_value(value: ValueRef<'_>) -> Option<String> {
        match value {
            ValueRef::Null => None,
            ValueRef::Integer(number) => Some(number.to_string()),
            ValueRef::Real(number) => Some(number.to_string()),
            ValueRef::Text(text) => Some(String::from_utf8_lossy(text).into_owned()),
            ValueRef::Blob(bytes) => Some(format!("X'{}'", hex_encode(bytes))),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

impl LocalStore for SqliteStore<'_> {
    fn client_tables(&self) -> Result<Vec<String>> {
        let mut statement = self.conn.prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )?;
        let names = statement
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(names)
    }

    fn row_count(&self, table: &str) -> Result<usize> {
        let table = Self::checked_identifier(table)?;
        let count: i64 =
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn field_names(&self, table: &str) -> Result<Vec<String>> {
        let table = Self::checked_identifier(table)?;
        let statement = self.conn.prepare(&format!("SELECT * FROM {table} LIMIT 0"))?;
        Ok(statement
            .column_names()
            .into_iter()
            .map(ToString::to_string)
            .collect())
    }

    fn rows(&self, table: &str) -> Result<Vec<StoredRow>> {
        let table = Self::checked_identifier(table)?;
        let field_names = self.field_names(table)?;
        let pk_index = field_names
            .iter()
            .position(|name| name == PK_FIELD)
            .ok_or_else(|| {
                SyncError::Config(format!("table {table} has no {PK_FIELD} column"))
            })?;
        let modified_index = field_names.iter().position(|name| name == MODIFIED_FIELD);
        let move_off_index = field_names.iter().position(|name| name == MOVE_OFF_FIELD);

        let mut statement = self
            .conn
            .prepare(&format!("SELECT * FROM {table} ORDER BY {PK_FIELD}"))?;
        let column_count = field_names.len();
        let rows = statement
            .query_map([], |row| {
                let mut values = Vec::with_capacity(column_count);
                for index in 0..column_count {
                    values.push(Self::decode_value(row.get_ref(index)?));
                }
                Ok(values)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|values| {
                let pk = values[pk_index]
                    .as_deref()
                    .and_then(|text| text.parse().ok())
                    .ok_or_else(|| {
                        SyncError::Config(format!("table {table} has a non-integer {PK_FIELD}"))
                    })?;
                Ok(StoredRow {
                    pk,
                    when_modified: modified_index.and_then(|index| values[index].clone()),
                    move_off: move_off_index
                        .and_then(|index| values[index].as_deref())
                        .is_some_and(|flag| flag != "0"),
                    values,
                })
            })
            .collect()
    }

    fn pk_values(&self, table: &str) -> Result<Vec<i64>> {
        let table = Self::checked_identifier(table)?;
        let mut statement = self
            .conn
            .prepare(&format!("SELECT {PK_FIELD} FROM {table} ORDER BY {PK_FIELD}"))?;
        let pks = statement
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(pks)
    }

    fn has_patient_column(&self, table: &str) -> Result<bool> {
        Ok(self
            .field_names(table)?
            .iter()
            .any(|name| name == PATIENT_FK_FIELD))
    }

    fn patients(&self) -> Result<Vec<Patient>> {
        let mut statement = self.conn.prepare(&format!(
            "SELECT {PK_FIELD}, forename, surname, sex, dob, email, address, gp,
                    other_details, {MOVE_OFF_FIELD}
             FROM {PATIENT_TABLE} ORDER BY {PK_FIELD}"
        ))?;
        let mut patients: Vec<Patient> = statement
            .query_map([], |row| {
                Ok(Patient {
                    pk: row.get(0)?,
                    forename: row.get(1)?,
                    surname: row.get(2)?,
                    sex: row.get(3)?,
                    dob: row.get(4)?,
                    email: row.get(5)?,
                    address: row.get(6)?,
                    gp: row.get(7)?,
                    other_details: row.get(8)?,
                    id_numbers: BTreeMap::new(),
                    move_off_device: row.get::<_, i64>(9)? != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut idnum_statement = self.conn.prepare(&format!(
            "SELECT {PATIENT_FK_FIELD}, which_idnum, idnum_value
             FROM {PATIENT_IDNUM_TABLE}
             WHERE idnum_value IS NOT NULL"
        ))?;
        let idnums = idnum_statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, u16>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (patient_pk, which, value) in idnums {
            if let Some(patient) = patients.iter_mut().find(|patient| patient.pk == patient_pk) {
                patient.id_numbers.insert(which, value);
            }
        }
        Ok(patients)
    }

    fn task_records(&self, table: &str) -> Result<Vec<TaskRecord>> {
        let table = Self::checked_identifier(table)?;
        let has_patient = self.has_patient_column(table)?;
        let patient_column = if has_patient {
            PATIENT_FK_FIELD
        } else {
            "NULL"
        };
        let mut statement = self.conn.prepare(&format!(
            "SELECT {PK_FIELD}, {patient_column}, {MOVE_OFF_FIELD} FROM {table}"
        ))?;
        let records = statement
            .query_map([], |row| {
                Ok(TaskRecord {
                    table: table.to_string(),
                    pk: row.get(0)?,
                    patient_pk: row.get(1)?,
                    move_off_device: row.get::<_, i64>(2)? != 0,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn delete_rows(&self, table: &str, pks: &[i64]) -> Result<usize> {
        let table = Self::checked_identifier(table)?;
        let mut deleted = 0;
        let mut statement = self
            .conn
            .prepare(&format!("DELETE FROM {table} WHERE {PK_FIELD} = ?"))?;
        for pk in pks {
            deleted += statement.execute(params![pk])?;
        }
        Ok(deleted)
    }

    fn delete_rows_for_patient(&self, table: &str, patient_pk: i64) -> Result<usize> {
        let table = Self::checked_identifier(table)?;
        if !self.has_patient_column(table)? {
            return Ok(0);
        }
        Ok(self.conn.execute(
            &format!("DELETE FROM {table} WHERE {PATIENT_FK_FIELD} = ?"),
            params![patient_pk],
        )?)
    }

    fn wipe_table(&self, table: &str) -> Result<usize> {
        let table = Self::checked_identifier(table)?;
        Ok(self.conn.execute(&format!("DELETE FROM {table}"), [])?)
    }

    fn clear_move_off_flags(&self, table: &str) -> Result<usize> {
        let table = Self::checked_identifier(table)?;
        if !self
            .field_names(table)?
            .iter()
            .any(|name| name == MOVE_OFF_FIELD)
        {
            return Ok(0);
        }
        Ok(self.conn.execute(
            &format!("UPDATE {table} SET {MOVE_OFF_FIELD} = 0 WHERE {MOVE_OFF_FIELD} != 0"),
            [],
        )?)
    }

    fn clear_move_off_flags_except(&self, table: &str, patient_pks: &[i64]) -> Result<usize> {
        if patient_pks.is_empty() {
            return self.clear_move_off_flags(table);
        }
        let table = Self::checked_identifier(table)?;
        let fields = self.field_names(table)?;
        if !fields.iter().any(|name| name == MOVE_OFF_FIELD) {
            return Ok(0);
        }
        let spared = patient_pks
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let owner = if table == PATIENT_TABLE {
            format!("{PK_FIELD} NOT IN ({spared})")
        } else if fields.iter().any(|name| name == PATIENT_FK_FIELD) {
            format!("({PATIENT_FK_FIELD} IS NULL OR {PATIENT_FK_FIELD} NOT IN ({spared}))")
        } else {
            "1".to_string()
        };
        Ok(self.conn.execute(
            &format!(
                "UPDATE {table} SET {MOVE_OFF_FIELD} = 0
                 WHERE {MOVE_OFF_FIELD} != 0 AND {owner}"
            ),
            [],
        )?)
    }

    fn reduce_patient_to_shell(&self, patient_pk: i64) -> Result<usize> {
        Ok(self.conn.execute(
            &format!(
                "UPDATE {PATIENT_TABLE}
                 SET email = NULL, address = NULL, gp = NULL, other_details = NULL,
                     {MOVE_OFF_FIELD} = 0
                 WHERE {PK_FIELD} = ?
                   AND (email IS NOT NULL OR address IS NOT NULL OR gp IS NOT NULL
                        OR other_details IS NOT NULL OR {MOVE_OFF_FIELD} != 0)"
            ),
            params![patient_pk],
        )?)
    }

    fn prune_dead_blobs(&self) -> Result<usize> {
        let mut statement = self.conn.prepare(&format!(
            "SELECT {PK_FIELD}, src_table, src_pk FROM {BLOB_TABLE}"
        ))?;
        let blobs = statement
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let tables = self.client_tables()?;
        let mut dead = Vec::new();
        for (blob_pk, src_table, src_pk) in blobs {
            let alive = tables.contains(&src_table)
                && Self::checked_identifier(&src_table).is_ok()
                && self.conn.query_row(
                    &format!("SELECT COUNT(*) FROM {src_table} WHERE {PK_FIELD} = ?"),
                    params![src_pk],
                    |row| row.get::<_, i64>(0),
                )? > 0;
            if !alive {
                dead.push(blob_pk);
            }
        }
        self.delete_rows(BLOB_TABLE, &dead)
    }

    fn payload_bytes(&self, table: &str) -> Result<u64> {
        let mut total = 0u64;
        for row in self.rows(table)? {
            for value in &row.values {
                // One byte for the separator, plus the literal itself.
                total += value.as_ref().map_or(4, String::len) as u64 + 1;
            }
        }
        Ok(total)
    }
}
