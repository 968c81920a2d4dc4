//! Reader connection pool.
//!
//! Readers do not open the database file themselves: a second database
//! instance on the writer's file would conflict with its lock, and its reads
//! would lag behind uncheckpointed writes. Instead the pool hands out clones
//! of the writer's connection, so every reader shares the writer's database
//! instance and sees committed writes immediately.

use std::sync::{Arc, Mutex};

use duckdb::Connection;
use r2d2::{Pool, PooledConnection};

use crate::storage::StorageError;

/// r2d2 manager that clones reader connections from the writer's connection.
pub struct SharedConnectionManager {
    prototype: Mutex<Connection>,
}

impl SharedConnectionManager {
    fn new(conn: Connection) -> Self {
        Self {
            prototype: Mutex::new(conn),
        }
    }
}

impl r2d2::ManageConnection for SharedConnectionManager {
    type Connection = Connection;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<Connection, Self::Error> {
        // A poisoned lock only means another clone panicked; the prototype
        // connection itself is still usable.
        let prototype = match self.prototype.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        prototype.try_clone()
    }

    fn is_valid(&self, conn: &mut Connection) -> Result<(), Self::Error> {
        conn.query_row("SELECT 1", [], |_| Ok(()))
    }

    fn has_broken(&self, _conn: &mut Connection) -> bool {
        false
    }
}

/// Connection pool for concurrent read operations.
pub struct ReadPool {
    pool: Pool<SharedConnectionManager>,
}

impl ReadPool {
    /// Create a read pool over a cloneable connection to the writer's
    /// database instance. Schema init has already happened by then.
    pub fn new(conn: Connection, size: u32) -> Result<Arc<Self>, StorageError> {
        let pool = Pool::builder()
            .max_size(size)
            .build(SharedConnectionManager::new(conn))?;

        Ok(Arc::new(Self { pool }))
    }

    /// Get a connection from the pool.
    pub fn get(&self) -> Result<PooledConnection<SharedConnectionManager>, StorageError> {
        Ok(self.pool.get()?)
    }
}
