//! Bounded pool of exclusive SQLite handles.
//!
//! Every database operation runs on a handle borrowed from here; handles are
//! never shared between tasks. Slots are opened lazily on first borrow.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rusqlite::Connection;

use crate::error::Result;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

enum Slot {
    /// Not yet opened; first borrow initializes the connection.
    Vacant,
    Ready(Connection),
}

struct Shared {
    db_path: PathBuf,
    slots: Mutex<VecDeque<Slot>>,
    available: Condvar,
}

impl Shared {
    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }
}

/// Bounded pool handing out exclusive [`Connection`]s.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<Shared>,
}

impl Pool {
    pub fn new(db_path: impl Into<PathBuf>, size: usize) -> Self {
        let slots = (0..size.max(1)).map(|_| Slot::Vacant).collect();
        Self {
            shared: Arc::new(Shared {
                db_path: db_path.into(),
                slots: Mutex::new(slots),
                available: Condvar::new(),
            }),
        }
    }

    pub fn db_path(&self) -> &std::path::Path {
        &self.shared.db_path
    }

    /// Borrow a handle, blocking until one is free. The handle goes back to
    /// this pool when the guard drops; it cannot reach any other pool.
    pub fn borrow(&self) -> Result<PooledConn> {
        let mut slots = self.shared.slots.lock();
        loop {
            if let Some(slot) = slots.pop_front() {
                drop(slots);
                let conn = match slot {
                    Slot::Ready(conn) => conn,
                    Slot::Vacant => match self.shared.open() {
                        Ok(conn) => conn,
                        Err(e) => {
                            // Keep the pool at its configured size.
                            let mut slots = self.shared.slots.lock();
                            slots.push_back(Slot::Vacant);
                            self.shared.available.notify_one();
                            return Err(e);
                        }
                    },
                };
                return Ok(PooledConn {
                    conn: Some(conn),
                    shared: Arc::clone(&self.shared),
                });
            }
            self.shared.available.wait(&mut slots);
        }
    }
}

/// Exclusive borrowed handle; derefs to [`rusqlite::Connection`].
pub struct PooledConn {
    conn: Option<Connection>,
    shared: Arc<Shared>,
}

impl Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConn {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let mut slots = self.shared.slots.lock();
            slots.push_back(Slot::Ready(conn));
            self.shared.available.notify_one();
        }
    }
}
