//! Wire shapes of the database tables and function arguments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vaultsync_core::{ActivityRecord, CheckinRequest, NewFile, SerializationSettings, ServerRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRow {
    pub id: String,
    pub vault_id: String,
    pub file_path: String,
    pub file_name: String,
    pub content_hash: Option<String>,
    #[serde(default)]
    pub file_size: u64,
    pub version: u32,
    #[serde(default)]
    pub checked_out_by: Option<String>,
    #[serde(default)]
    pub checked_out_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<FileRow> for ServerRecord {
    fn from(row: FileRow) -> Self {
        ServerRecord {
            id: row.id,
            vault_id: row.vault_id,
            path: row.file_path,
            name: row.file_name,
            content_hash: row.content_hash,
            size: row.file_size,
            version: row.version,
            checked_out_by: row.checked_out_by,
            checked_out_at: row.checked_out_at,
            updated_by: row.updated_by,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NewFileRow<'a> {
    pub vault_id: &'a str,
    pub file_path: &'a str,
    pub file_name: &'a str,
    pub content_hash: &'a str,
    pub file_size: u64,
    pub version: u32,
    pub updated_by: &'a str,
}

impl<'a> NewFileRow<'a> {
    pub fn new(vault_id: &'a str, user_id: &'a str, file: &'a NewFile) -> Self {
        Self {
            vault_id,
            file_path: &file.path,
            file_name: &file.name,
            content_hash: &file.content_hash,
            file_size: file.size,
            version: 1,
            updated_by: user_id,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CheckoutPatch<'a> {
    pub checked_out_by: &'a str,
    pub checked_out_at: DateTime<Utc>,
}

/// Arguments shared by `checkin_file` and `admin_force_checkin`.
#[derive(Debug, Serialize)]
pub struct CheckinArgs<'a> {
    pub p_file_id: &'a str,
    pub p_user_id: &'a str,
    pub p_new_content_hash: Option<&'a str>,
    pub p_new_file_size: Option<u64>,
    pub p_new_file_path: Option<&'a str>,
    pub p_new_file_name: Option<&'a str>,
    pub p_comment: Option<&'a str>,
}

impl<'a> CheckinArgs<'a> {
    pub fn new(file_id: &'a str, user_id: &'a str, request: &'a CheckinRequest) -> Self {
        Self {
            p_file_id: file_id,
            p_user_id: user_id,
            p_new_content_hash: request.new_content_hash.as_deref(),
            p_new_file_size: request.new_file_size,
            p_new_file_path: request.new_file_path.as_deref(),
            p_new_file_name: request.new_file_name.as_deref(),
            p_comment: request.comment.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FileUserArgs<'a> {
    pub p_file_id: &'a str,
    pub p_user_id: &'a str,
}

#[derive(Debug, Serialize)]
pub struct ActivityRow<'a> {
    pub user_id: &'a str,
    pub action: vaultsync_core::ActivityAction,
    pub file_id: &'a str,
    pub file_path: &'a str,
    pub created_at: DateTime<Utc>,
    pub details: Option<&'a str>,
}

impl<'a> From<&'a ActivityRecord> for ActivityRow<'a> {
    fn from(record: &'a ActivityRecord) -> Self {
        Self {
            user_id: &record.user_id,
            action: record.action,
            file_id: &record.file_id,
            file_path: &record.file_path,
            created_at: record.at,
            details: record.details.as_deref(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SettingsRow {
    pub settings: SerializationSettings,
}

#[derive(Debug, Serialize)]
pub struct OrgArgs<'a> {
    pub p_org_id: &'a str,
}

#[derive(Debug, Serialize)]
pub struct SaveSettingsArgs<'a> {
    pub p_org_id: &'a str,
    pub p_settings: &'a SerializationSettings,
}

#[derive(Debug, Serialize)]
pub struct SetCounterArgs<'a> {
    pub p_org_id: &'a str,
    pub p_expected: u64,
    pub p_value: u64,
}
