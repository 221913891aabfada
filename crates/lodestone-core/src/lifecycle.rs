//! Makes sure the target database and collection exist before indexing.
//!
//! | database exists | overwrite | action                                          |
//! |-----------------|-----------|-------------------------------------------------|
//! | no              | -         | create database and collection                  |
//! | yes             | no        | skip, nothing to index                          |
//! | yes             | yes       | drop every collection and the database, rebuild |

use tokio_util::sync::CancellationToken;

use crate::index::{until_cancelled, IndexError};
use crate::store::{CollectionPath, CollectionSchema, IndexSpec, VectorStore};

/// What [`ensure_collection`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    /// Database was missing and has been created along with the collection.
    Created,
    /// Database existed and was rebuilt from scratch.
    Recreated,
    /// Database already exists and overwrite was not requested. Do not index.
    Skipped,
}

impl CollectionState {
    /// Whether the caller should go on to run the pipeline.
    pub fn should_index(self) -> bool {
        !matches!(self, CollectionState::Skipped)
    }
}

/// Prepares `target` for inserts. Schema and index are validated before any
/// store call, so a bad dimension never leaves a half-built database behind.
/// Must run before the pipeline starts, never alongside it. Stops with
/// [`IndexError::Cancelled`] at the next store call once `cancel` fires.
pub async fn ensure_collection(
    store: &dyn VectorStore,
    target: &CollectionPath,
    schema: &CollectionSchema,
    index: &IndexSpec,
    overwrite: bool,
    cancel: &CancellationToken,
) -> Result<CollectionState, IndexError> {
    schema.validate()?;
    index.validate(schema)?;

    let databases = until_cancelled(cancel, store.list_databases()).await?;
    let exists = databases.iter().any(|d| *d == target.database);

    let state = match (exists, overwrite) {
        (false, _) => {
            until_cancelled(cancel, store.create_database(&target.database)).await?;
            CollectionState::Created
        }
        (true, false) => {
            tracing::info!(database = %target.database, "database exists, skipping indexing");
            return Ok(CollectionState::Skipped);
        }
        (true, true) => {
            let collections =
                until_cancelled(cancel, store.list_collections(&target.database)).await?;
            for name in collections {
                let path = CollectionPath::new(&target.database, name);
                tracing::info!(collection = %path, "dropping collection");
                until_cancelled(cancel, store.drop_collection(&path)).await?;
            }
            until_cancelled(cancel, store.drop_database(&target.database)).await?;
            until_cancelled(cancel, store.create_database(&target.database)).await?;
            CollectionState::Recreated
        }
    };

    until_cancelled(cancel, store.create_collection(target, schema, index)).await?;
    tracing::info!(collection = %target, state = ?state, "collection ready");
    Ok(state)
}
