//! Database connection and initialization.

pub use taskflow_core::db::DatabaseError;

taskflow_core::define_database!(Database, "Database migrations complete");

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_works() {
        let db = Database::open_in_memory().await;
        assert!(db.is_ok());
    }

    #[tokio::test]
    async fn open_file_runs_migrations() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("tempdir: {e}"));
        let db = Database::open(&dir.path().join("taskflow.db")).await;
        assert!(db.is_ok());
    }
}
