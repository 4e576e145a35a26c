use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Nullable, Text, Timestamptz};
use serde::{Deserialize, Serialize};

/// The two families of attachments. Each has its own table and token space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AttachmentKind {
    /// Files attached to claim records.
    #[serde(rename = "documents")]
    Document,
    /// PDF evidence attached to collaborator profiles.
    #[serde(rename = "evidence")]
    Evidence,
}

impl AttachmentKind {
    pub const ALL: [AttachmentKind; 2] = [AttachmentKind::Document, AttachmentKind::Evidence];

    pub fn slug(self) -> &'static str {
        match self {
            AttachmentKind::Document => "documents",
            AttachmentKind::Evidence => "evidence",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            AttachmentKind::Document => "claim_documents",
            AttachmentKind::Evidence => "collaborator_evidence",
        }
    }

    pub fn owner_table(self) -> &'static str {
        match self {
            AttachmentKind::Document => "claims",
            AttachmentKind::Evidence => "collaborators",
        }
    }

    /// Directory under the upload root that holds this kind's files.
    pub fn storage_dir(self) -> &'static str {
        match self {
            AttachmentKind::Document => "documents",
            AttachmentKind::Evidence => "evidence",
        }
    }

    /// Former name of the storage directory, before it was pluralised.
    pub fn legacy_storage_dir(self) -> Option<&'static str> {
        match self {
            AttachmentKind::Document => Some("document"),
            AttachmentKind::Evidence => None,
        }
    }
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for AttachmentKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        AttachmentKind::ALL
            .into_iter()
            .find(|kind| kind.slug().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| format!("unknown attachment kind '{value}'"))
    }
}

/// One stored file. Optional columns are `None` on deployments whose table
/// predates them.
#[derive(Debug, Clone, PartialEq, QueryableByName)]
pub struct Attachment {
    #[diesel(sql_type = BigInt)]
    pub id: i64,
    #[diesel(sql_type = BigInt)]
    pub owner_id: i64,
    #[diesel(sql_type = Text)]
    pub description: String,
    #[diesel(sql_type = Text)]
    pub stored_path: String,
    #[diesel(sql_type = Text)]
    pub access_token: String,
    #[diesel(sql_type = Nullable<BigInt>)]
    pub content_size: Option<i64>,
    #[diesel(sql_type = Nullable<Text>)]
    pub content_type: Option<String>,
    #[diesel(sql_type = Nullable<Timestamptz>)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub owner_id: i64,
    pub description: String,
    pub stored_path: String,
    pub access_token: String,
    pub content_size: i64,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
}

impl NewAttachment {
    pub fn into_attachment(self, id: i64) -> Attachment {
        Attachment {
            id,
            owner_id: self.owner_id,
            description: self.description,
            stored_path: self.stored_path,
            access_token: self.access_token,
            content_size: Some(self.content_size),
            content_type: Some(self.content_type),
            created_at: Some(self.created_at),
        }
    }
}
