//! # Repository Module
//!
//! Relational tier repositories.
//!
//! ## Repository Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Relational Tier Tables                               │
//! │                                                                         │
//! │  environments ──┬──► metadata_versions ──┬──► metadata_records ──► FTS │
//! │   (base URL)    │     (fingerprint)      │     (entity/action/enum)    │
//! │                 │                        └──► labels                   │
//! │                 └──► sync_sessions                                      │
//! │                                                                         │
//! │  Deleting a version cascades to its records and labels; the FTS        │
//! │  delete trigger keeps the lexical index in step.                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`EnvironmentRepository`] - Environment registry and sync marker
//! - [`VersionRepository`] - Version generations and retention
//! - [`RecordRepository`] - Entity, action and enumeration records
//! - [`LabelRepository`] - Resolved label text
//! - [`SessionRepository`] - Sync session persistence and history

pub mod environment;
pub mod label;
pub mod record;
pub mod session;
pub mod version;

pub use environment::EnvironmentRepository;
pub use label::LabelRepository;
pub use record::RecordRepository;
pub use session::SessionRepository;
pub use version::VersionRepository;

#[cfg(test)]
pub(crate) mod test_support {
    use metacache_core::{
        DataEntityRecord, Environment, MetadataRecord, MetadataVersion, RecordHeader,
        StoredVersion,
    };

    use crate::{Database, DbConfig};

    pub async fn setup() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    pub fn version(app: &str) -> MetadataVersion {
        MetadataVersion {
            application_version: app.to_string(),
            platform_version: "7.0.7000".to_string(),
            application_build: format!("{app}.1"),
            platform_build: "7.0.7000.10".to_string(),
        }
    }

    pub fn entity(name: &str, public_name: Option<&str>, label_id: Option<&str>) -> MetadataRecord {
        MetadataRecord::DataEntity(DataEntityRecord {
            header: RecordHeader {
                public_name: public_name.map(str::to_string),
                collection_name: public_name.map(|p| format!("{p}s")),
                category: Some("Master".to_string()),
                label_id: label_id.map(str::to_string),
                ..RecordHeader::named(name)
            },
        })
    }

    pub async fn env_with_version(db: &Database, app: &str) -> (Environment, StoredVersion) {
        let env = db
            .environments()
            .get_or_create("https://erp.example.com")
            .await
            .unwrap();
        let stored = db.versions().upsert(env.id, &version(app)).await.unwrap();
        db.environments()
            .set_current_version(env.id, stored.id)
            .await
            .unwrap();
        let env = db.environments().get(env.id).await.unwrap().unwrap();
        (env, stored)
    }
}
