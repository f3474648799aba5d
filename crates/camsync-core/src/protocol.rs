//! Wire protocol: flat keyed requests and replies
//!
//! Every exchange is an HTTP POST of url-encoded key/value pairs; the server
//! answers with `key:value` lines. A reply only counts as coming from the
//! sync API if it carries a success flag and session credentials - anything
//! else (a web-server error page, say) is a protocol error surfaced verbatim.
//!
//! Multi-record replies enumerate `nfields`, `nrecords`, a comma-separated
//! field list, and one `recordN` line per record holding CSV'd SQL literals.

use std::collections::BTreeMap;

use crate::error::{Result, SyncError};
use crate::models::{ExtraString, IdNumDescription, ServerInfo, Version};

/// Request/reply field names
pub mod keys {
    pub const OPERATION: &str = "operation";
    pub const CLIENT_VERSION: &str = "camcops_version";
    pub const DEVICE: &str = "device";
    pub const DEVICE_FRIENDLY_NAME: &str = "devicefriendlyname";
    pub const USER: &str = "user";
    pub const PASSWORD: &str = "password";
    pub const SESSION_ID: &str = "session_id";
    pub const SESSION_TOKEN: &str = "session_token";
    pub const SUCCESS: &str = "success";
    pub const ERROR: &str = "error";
    pub const RESULT: &str = "result";
    pub const SERVER_VERSION: &str = "serverCamcopsVersion";
    pub const DATABASE_TITLE: &str = "databaseTitle";
    pub const ID_POLICY_UPLOAD: &str = "idPolicyUpload";
    pub const ID_POLICY_FINALIZE: &str = "idPolicyFinalize";
    pub const FIELDS: &str = "fields";
    pub const NFIELDS: &str = "nfields";
    pub const NRECORDS: &str = "nrecords";
    pub const TABLE: &str = "table";
    pub const TABLES: &str = "tables";
    pub const PKNAME: &str = "pkname";
    pub const PKNAMEINFO: &str = "pknameinfo";
    pub const PKVALUES: &str = "pkvalues";
    pub const DATEVALUES: &str = "datevalues";
    pub const MOVE_OFF_VALUES: &str = "move_off_device_values";
    pub const VALUES: &str = "values";
    pub const NRECORDS_FIELD_PREFIX: &str = "record";
    pub const PATIENT_INFO: &str = "patient_info";
    pub const FINALIZING: &str = "finalizing";
    pub const DBDATA: &str = "dbdata";
    pub const ID_DESCRIPTION_PREFIX: &str = "idDescription";
    pub const ID_SHORT_DESCRIPTION_PREFIX: &str = "idShortDescription";
    pub const ID_VALIDATION_METHOD_PREFIX: &str = "idValidationMethod";
}

/// Protocol operation names
pub mod ops {
    pub const CHECK_DEVICE_REGISTERED: &str = "check_device_registered";
    pub const CHECK_UPLOAD_USER_AND_DEVICE: &str = "check_upload_user_and_device";
    pub const REGISTER: &str = "register";
    pub const GET_ID_INFO: &str = "get_id_info";
    pub const GET_ALLOWED_TABLES: &str = "get_allowed_tables";
    pub const GET_EXTRA_STRINGS: &str = "get_extra_strings";
    pub const GET_TASK_SCHEDULES: &str = "get_task_schedules";
    pub const VALIDATE_PATIENTS: &str = "validate_patients";
    pub const START_UPLOAD: &str = "start_upload";
    pub const START_PRESERVATION: &str = "start_preservation";
    pub const UPLOAD_TABLE: &str = "upload_table";
    pub const UPLOAD_RECORD: &str = "upload_record";
    pub const UPLOAD_EMPTY_TABLES: &str = "upload_empty_tables";
    pub const WHICH_KEYS_TO_SEND: &str = "which_keys_to_send";
    pub const DELETE_WHERE_KEY_NOT: &str = "delete_where_key_not";
    pub const UPLOAD_ENTIRE_DATABASE: &str = "upload_entire_database";
    pub const END_UPLOAD: &str = "end_upload";
    pub const WIPE_SPECIFIED: &str = "wipe_specified";
}

/// One outgoing request: an operation plus its operation-specific fields.
///
/// Transport-level fields (client version, device, credentials, session) are
/// appended by the transport, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerRequest {
    fields: Vec<(String, String)>,
}

impl ServerRequest {
    /// Start a request for the named operation
    #[must_use]
    pub fn new(operation: &str) -> Self {
        Self {
            fields: vec![(keys::OPERATION.to_string(), operation.to_string())],
        }
    }

    /// Add a field
    #[must_use]
    pub fn field(mut self, key: &str, value: impl Into<String>) -> Self {
        self.fields.push((key.to_string(), value.into()));
        self
    }

    /// The operation this request performs
    #[must_use]
    pub fn operation(&self) -> &str {
        self.fields
            .first()
            .map_or("", |(_, operation)| operation.as_str())
    }

    /// All fields, in insertion order
    #[must_use]
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Append a transport-level field in place
    pub fn push_field(&mut self, key: &str, value: impl Into<String>) {
        self.fields.push((key.to_string(), value.into()));
    }
}

/// A parsed server reply: a flat keyed field set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerReply {
    fields: BTreeMap<String, String>,
}

/// One decoded record from a multi-record reply: field name -> value
pub type WireRecord = BTreeMap<String, Option<String>>;

impl ServerReply {
    /// Parse a raw reply body of `key:value` lines
    #[must_use]
    pub fn parse(body: &str) -> Self {
        let mut fields = BTreeMap::new();
        for line in body.lines() {
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim();
                if !key.is_empty() {
                    fields.insert(key.to_string(), value.trim().to_string());
                }
            }
        }
        Self { fields }
    }

    /// Build a reply directly from fields (used by in-process test servers)
    #[must_use]
    pub fn from_fields(fields: BTreeMap<String, String>) -> Self {
        Self { fields }
    }

    /// A reply from the sync API always carries these keys; anything else is
    /// some other server talking.
    pub fn ensure_api_reply(&self, raw_body: &str) -> Result<()> {
        let recognizable = self.fields.contains_key(keys::SUCCESS)
            && self.fields.contains_key(keys::SESSION_ID)
            && self.fields.contains_key(keys::SESSION_TOKEN);
        if recognizable {
            Ok(())
        } else {
            Err(SyncError::Protocol(format!(
                "reply is not a recognizable sync API reply; body was: {}",
                raw_body.trim()
            )))
        }
    }

    /// Did the reply report success?
    #[must_use]
    pub fn success(&self) -> bool {
        self.get(keys::SUCCESS)
            .and_then(|value| value.parse::<i64>().ok())
            .is_some_and(|flag| flag != 0)
    }

    /// The server's error message, if it sent one
    #[must_use]
    pub fn error_message(&self) -> String {
        self.get(keys::ERROR)
            .map_or_else(|| "(no error message)".to_string(), ToString::to_string)
    }

    /// Session credentials to echo on the next request
    #[must_use]
    pub fn session(&self) -> Option<(String, String)> {
        Some((
            self.get(keys::SESSION_ID)?.to_string(),
            self.get(keys::SESSION_TOKEN)?.to_string(),
        ))
    }

    /// Server version, when the reply carries one
    #[must_use]
    pub fn server_version(&self) -> Option<Version> {
        self.get(keys::SERVER_VERSION)?.parse().ok()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Fetch a key the protocol says must be present
    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| SyncError::Protocol(format!("reply missing expected key: {key}")))
    }

    /// Number of records a multi-record reply declares, zero if none
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.get(keys::NRECORDS)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    /// Decode a multi-record reply.
    ///
    /// A declared field count that disagrees with the actual field list is a
    /// warning only; the actual list wins. Everything else malformed is a
    /// protocol error.
    pub fn records(&self) -> Result<Vec<WireRecord>> {
        let nrecords: usize = self
            .require(keys::NRECORDS)?
            .parse()
            .map_err(|_| SyncError::Protocol("nrecords is not a number".to_string()))?;
        if nrecords == 0 {
            return Err(SyncError::Protocol("reply contains no records".to_string()));
        }
        let declared_nfields: usize = self
            .require(keys::NFIELDS)?
            .parse()
            .map_err(|_| SyncError::Protocol("nfields is not a number".to_string()))?;
        let field_list = self.require(keys::FIELDS)?;
        let field_names: Vec<&str> = field_list.split(',').collect();
        if field_names.is_empty() || field_list.is_empty() {
            return Err(SyncError::Protocol("reply contains no fields".to_string()));
        }
        if declared_nfields != field_names.len() {
            tracing::warn!(
                declared = declared_nfields,
                actual = field_names.len(),
                fields = field_list,
                "declared field count doesn't match field list; using actual list"
            );
        }

        let mut records = Vec::with_capacity(nrecords);
        for index in 0..nrecords {
            let record_key = format!("{}{index}", keys::NRECORDS_FIELD_PREFIX);
            let raw = self.require(&record_key)?;
            let values = split_sql_literals(raw)?;
            if values.len() != field_names.len() {
                return Err(SyncError::Protocol(format!(
                    "record {index} has {} value(s) for {} field(s)",
                    values.len(),
                    field_names.len()
                )));
            }
            records.push(
                field_names
                    .iter()
                    .map(|name| (*name).to_string())
                    .zip(values)
                    .collect(),
            );
        }
        Ok(records)
    }
}

/// Server identification, as returned by `register` and `get_id_info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentification {
    pub server_version: Version,
    pub database_title: String,
    pub upload_policy: String,
    pub finalize_policy: String,
    pub id_descriptions: BTreeMap<u16, IdNumDescription>,
}

impl TryFrom<&ServerReply> for ServerIdentification {
    type Error = SyncError;

    fn try_from(reply: &ServerReply) -> Result<Self> {
        let server_version: Version = reply
            .require(keys::SERVER_VERSION)?
            .parse()
            .map_err(|_| SyncError::Protocol("unparsable server version".to_string()))?;
        let mut id_descriptions = BTreeMap::new();
        for (key, value) in &reply.fields {
            let Some(which) = parse_numbered_key(key, keys::ID_DESCRIPTION_PREFIX) else {
                continue;
            };
            let short_key = format!("{}{which}", keys::ID_SHORT_DESCRIPTION_PREFIX);
            let validation_key = format!("{}{which}", keys::ID_VALIDATION_METHOD_PREFIX);
            id_descriptions.insert(
                which,
                IdNumDescription {
                    which_idnum: which,
                    description: value.clone(),
                    short_description: reply.get(&short_key).unwrap_or_default().to_string(),
                    validation_method: reply.get(&validation_key).map(ToString::to_string),
                },
            );
        }
        Ok(Self {
            server_version,
            database_title: reply.get(keys::DATABASE_TITLE).unwrap_or_default().to_string(),
            upload_policy: reply.require(keys::ID_POLICY_UPLOAD)?.to_string(),
            finalize_policy: reply.require(keys::ID_POLICY_FINALIZE)?.to_string(),
            id_descriptions,
        })
    }
}

impl ServerIdentification {
    /// Assemble a full [`ServerInfo`] snapshot from this identification plus
    /// separately fetched table and string data.
    #[must_use]
    pub fn into_server_info(
        self,
        allowed_tables: BTreeMap<String, Version>,
        extra_strings: Vec<ExtraString>,
    ) -> ServerInfo {
        ServerInfo {
            server_version: self.server_version,
            database_title: self.database_title,
            upload_policy: self.upload_policy,
            finalize_policy: self.finalize_policy,
            id_descriptions: self.id_descriptions,
            allowed_tables,
            extra_strings,
        }
    }
}

/// Decode a `get_allowed_tables` record set into table -> minimum client
/// version.
pub fn allowed_tables_from_records(records: &[WireRecord]) -> Result<BTreeMap<String, Version>> {
    let mut tables = BTreeMap::new();
    for record in records {
        let name = required_value(record, "tablename")?;
        let version: Version = required_value(record, "min_client_version")?
            .parse()
            .map_err(|_| {
                SyncError::Protocol(format!("unparsable min_client_version for table {name}"))
            })?;
        tables.insert(name, version);
    }
    Ok(tables)
}

/// Decode a `get_extra_strings` record set
pub fn extra_strings_from_records(records: &[WireRecord]) -> Result<Vec<ExtraString>> {
    records
        .iter()
        .map(|record| {
            Ok(ExtraString {
                task: required_value(record, "task")?,
                name: required_value(record, "name")?,
                language: record
                    .get("language")
                    .cloned()
                    .flatten()
                    .unwrap_or_default(),
                value: required_value(record, "value")?,
            })
        })
        .collect()
}

fn required_value(record: &WireRecord, field: &str) -> Result<String> {
    record
        .get(field)
        .cloned()
        .flatten()
        .ok_or_else(|| SyncError::Protocol(format!("record missing field: {field}")))
}

fn parse_numbered_key(key: &str, prefix: &str) -> Option<u16> {
    // "idDescription" is a prefix of nothing else numeric, but guard against
    // "idShortDescription" matching the "idDescription" scan.
    if prefix == keys::ID_DESCRIPTION_PREFIX && key.starts_with(keys::ID_SHORT_DESCRIPTION_PREFIX) {
        return None;
    }
    key.strip_prefix(prefix)?.parse().ok()
}

/// Split one `recordN` payload: CSV of SQL literals.
///
/// Strings are single-quoted with `''` escaping; `NULL` decodes to `None`;
/// numbers and hex blobs pass through as their literal text.
pub fn split_sql_literals(raw: &str) -> Result<Vec<Option<String>>> {
    let mut values = Vec::new();
    let mut chars = raw.chars().peekable();
    loop {
        // One literal per iteration.
        while matches!(chars.peek(), Some(' ')) {
            chars.next();
        }
        if chars.peek() == Some(&'\'') {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some('\'') => {
                        if chars.peek() == Some(&'\'') {
                            chars.next();
                            text.push('\'');
                        } else {
                            break;
                        }
                    }
                    Some(ch) => text.push(ch),
                    None => {
                        return Err(SyncError::Protocol(
                            "unterminated string literal in record".to_string(),
                        ))
                    }
                }
            }
            values.push(Some(text));
            // Skip to the comma (or end).
            while let Some(&ch) = chars.peek() {
                chars.next();
                if ch == ',' {
                    break;
                }
            }
        } else {
            let mut token = String::new();
            let mut saw_comma = false;
            while let Some(&ch) = chars.peek() {
                chars.next();
                if ch == ',' {
                    saw_comma = true;
                    break;
                }
                token.push(ch);
            }
            let token = token.trim().to_string();
            if token.is_empty() && !saw_comma && values.is_empty() {
                // Entirely empty payload: zero values.
                break;
            }
            if token.eq_ignore_ascii_case("NULL") {
                values.push(None);
            } else {
                values.push(Some(token));
            }
            if !saw_comma {
                break;
            }
            continue;
        }
        if chars.peek().is_none() {
            break;
        }
    }
    Ok(values)
}

/// Render values back into the CSV-of-SQL-literals form used for uploads
#[must_use]
pub fn join_sql_literals(values: &[Option<String>]) -> String {
    values
        .iter()
        .map(|value| match value {
            None => "NULL".to_string(),
            Some(text) => {
                if is_bare_literal(text) {
                    text.clone()
                } else {
                    format!("'{}'", text.replace('\'', "''"))
                }
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

fn is_bare_literal(text: &str) -> bool {
    if text.is_empty() {
        return false;
    }
    text.parse::<f64>().is_ok() || is_hex_blob_literal(text)
}

/// `X'ABCD'` blob literals travel unquoted, like numbers; quoting one would
/// turn binary data into a string server-side.
fn is_hex_blob_literal(text: &str) -> bool {
    text.strip_prefix("X'")
        .or_else(|| text.strip_prefix("x'"))
        .and_then(|rest| rest.strip_suffix('\''))
        .is_some_and(|digits| digits.chars().all(|ch| ch.is_ascii_hexdigit()))
}
