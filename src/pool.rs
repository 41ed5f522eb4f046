// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bounded pool of reusable connections
//!
//! Connections are loaned, never given away: [`ConnectionPool::get`] hands
//! out a [`PooledConnection`] guard whose drop returns the connection to the
//! idle queue. A guard that is leaked (via [`std::mem::forget`]) permanently
//! reduces effective capacity.

use std::{
    collections::VecDeque,
    fmt,
    io,
    ops::{Deref, DerefMut},
    sync::{Arc, Condvar, Mutex},
};

use crate::error::{Error, Result};

type Factory<T> = Box<dyn FnMut() -> io::Result<T> + Send>;

struct PoolInner<T> {
    idle: VecDeque<T>,
    created: usize,
    factory: Factory<T>,
}

struct Shared<T> {
    capacity: usize,
    inner: Mutex<PoolInner<T>>,
    available: Condvar,
}

impl<T> Shared<T> {
    fn release(&self, conn: T) {
        let mut inner = self.inner.lock().unwrap();
        inner.idle.push_back(conn);
        self.available.notify_one();
    }
}

/// Fixed-capacity pool with blocking acquisition and lazy construction.
///
/// Cloning the pool yields another handle to the same shared state, so it
/// can be handed to as many threads as needed.
pub struct ConnectionPool<T> {
    shared: Arc<Shared<T>>,
}

impl<T> ConnectionPool<T> {
    /// Creates an empty pool that will construct at most `capacity`
    /// connections through `factory`.
    ///
    /// The factory runs with the pool lock held, a deliberate
    /// simplification: keep it quick (or the capacity low), and never
    /// reenter the pool from inside it.
    pub fn new<F>(capacity: usize, factory: F) -> Self
    where
        F: FnMut() -> io::Result<T> + Send + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                capacity,
                inner: Mutex::new(PoolInner {
                    idle: VecDeque::with_capacity(capacity),
                    created: 0,
                    factory: Box::new(factory),
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Borrows a connection, blocking until one is available.
    ///
    /// Idle connections are preferred; below capacity a fresh one is built
    /// through the factory; at capacity the call waits on a released
    /// connection with no fairness or timeout guarantee. Factory failure
    /// surfaces [`Error::ConnCreate`] and leaves the pool unchanged.
    pub fn get(&self) -> Result<PooledConnection<T>> {
        let mut inner = self.shared.inner.lock().unwrap();

        loop {
            if let Some(conn) = inner.idle.pop_front() {
                return Ok(PooledConnection::new(conn, Arc::clone(&self.shared)));
            }

            if inner.created < self.shared.capacity {
                let conn = (inner.factory)().map_err(Error::ConnCreate)?;
                inner.created += 1;
                return Ok(PooledConnection::new(conn, Arc::clone(&self.shared)));
            }

            inner = self.shared.available.wait(inner).unwrap();
        }
    }

    /// Maximum number of connections this pool will ever own.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Connections constructed so far (idle or checked out).
    pub fn created(&self) -> usize {
        self.shared.inner.lock().unwrap().created
    }

    /// Connections currently idle in the queue.
    pub fn idle(&self) -> usize {
        self.shared.inner.lock().unwrap().idle.len()
    }
}

impl<T> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for ConnectionPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("capacity", &self.capacity())
            .field("created", &self.created())
            .field("idle", &self.idle())
            .finish()
    }
}

/// Borrow token for a pooled connection.
///
/// Dereferences to the connection. Dropping the guard is the release
/// obligation; [`release`](Self::release) spells it out at call sites that
/// want the hand-back visible.
pub struct PooledConnection<T> {
    conn: Option<T>,
    shared: Arc<Shared<T>>,
}

impl<T> PooledConnection<T> {
    fn new(conn: T, shared: Arc<Shared<T>>) -> Self {
        Self {
            conn: Some(conn),
            shared,
        }
    }

    /// Returns the connection to the pool and wakes one waiter.
    pub fn release(self) {}
}

impl<T> Deref for PooledConnection<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.conn.as_ref().unwrap()
    }
}

impl<T> DerefMut for PooledConnection<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.conn.as_mut().unwrap()
    }
}

impl<T> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.release(conn);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PooledConnection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}
