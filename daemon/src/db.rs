use std::path::Path;

use surrealdb::engine::local::{Db, Mem, SurrealKv};
use surrealdb::Surreal;

use crate::store::StoreError;

/// Wrapper around the SurrealDB handle.
/// Clone is cheap (Arc internally).
#[derive(Clone)]
pub struct DbHandle {
	pub db: Surreal<Db>,
}

/// Open (or create) the on-disk database and run migrations.
pub async fn open(path: &Path) -> Result<DbHandle, StoreError> {
	if let Some(parent) = path.parent() {
		std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(format!("{}: {e}", parent.display())))?;
	}
	let db = Surreal::new::<SurrealKv>(path.to_path_buf()).await?;
	init(db).await
}

/// In-memory database, used by tests and dry runs.
pub async fn memory() -> Result<DbHandle, StoreError> {
	let db = Surreal::new::<Mem>(()).await?;
	init(db).await
}

async fn init(db: Surreal<Db>) -> Result<DbHandle, StoreError> {
	db.use_ns("ferry").use_db("agent").await?;
	run_migrations(&db).await?;
	Ok(DbHandle { db })
}

/// Run schema migrations. DEFINE statements are idempotent.
async fn run_migrations(db: &Surreal<Db>) -> Result<(), StoreError> {
	db.query(SCHEMA_V1).await?.check()?;
	Ok(())
}

const SCHEMA_V1: &str = "
    DEFINE TABLE OVERWRITE cached_file SCHEMAFULL;
    DEFINE FIELD OVERWRITE local_id ON cached_file TYPE string;
    DEFINE FIELD OVERWRITE remote_id ON cached_file TYPE string;
    DEFINE FIELD OVERWRITE source_id ON cached_file TYPE string;
    DEFINE FIELD OVERWRITE relative_path ON cached_file TYPE string;
    DEFINE FIELD OVERWRITE size ON cached_file TYPE int;
    DEFINE FIELD OVERWRITE mod_time ON cached_file TYPE int;
    DEFINE FIELD OVERWRITE content_hash ON cached_file TYPE string;
    DEFINE FIELD OVERWRITE revision ON cached_file TYPE int;
    DEFINE INDEX OVERWRITE idx_cached_file_local_id ON cached_file FIELDS local_id UNIQUE;

    DEFINE TABLE OVERWRITE file_transfer SCHEMAFULL;
    DEFINE FIELD OVERWRITE transfer_id ON file_transfer TYPE string;
    DEFINE FIELD OVERWRITE file_local_id ON file_transfer TYPE string;
    DEFINE FIELD OVERWRITE destination_id ON file_transfer TYPE string;
    DEFINE FIELD OVERWRITE status ON file_transfer TYPE string;
    DEFINE FIELD OVERWRITE bytes_transferred ON file_transfer TYPE int DEFAULT 0;
    DEFINE FIELD OVERWRITE attempts ON file_transfer TYPE int DEFAULT 0;
    DEFINE FIELD OVERWRITE created_at ON file_transfer TYPE int;
    DEFINE FIELD OVERWRITE updated_at ON file_transfer TYPE int;
    DEFINE INDEX OVERWRITE idx_file_transfer_id ON file_transfer FIELDS transfer_id UNIQUE;
    DEFINE INDEX OVERWRITE idx_file_transfer_file ON file_transfer FIELDS file_local_id;
    DEFINE INDEX OVERWRITE idx_file_transfer_status ON file_transfer FIELDS status;
";
