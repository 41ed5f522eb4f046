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

//! Asynchronous log sink
//!
//! A double-buffered aggregator: producers append pre-formatted records into
//! an in-memory buffer under a mutex, a dedicated writer thread drains full
//! buffers to the log file. Producers never touch the filesystem, so the
//! reactor thread can log without stalling its loop.
//!
//! Records are persisted verbatim: no formatting, no timestamps, no
//! delimiters. Callers should include a trailing newline.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    mem,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, OnceLock,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// Default log file, relative to the working directory.
const DEFAULT_PATH: &str = "server.log";

/// Queued buffers beyond this count are shed to keep producers unblocked.
const MAX_QUEUED_BUFFERS: usize = 25;

static GLOBAL: OnceLock<AsyncLog> = OnceLock::new();

/// Sink tuning, fixed at construction.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Bytes a front buffer holds before it is queued for the writer.
    pub buffer_capacity: usize,
    /// File size past which the writer rotates the log.
    pub rotate_bytes: u64,
    /// Longest the writer sleeps before flushing a quiet sink.
    pub flush_interval: Duration,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            buffer_capacity: 4_000_000,
            rotate_bytes: 64 * 1024 * 1024,
            flush_interval: Duration::from_secs(3),
        }
    }
}

#[derive(Debug)]
struct Buffer {
    data: Vec<u8>,
    limit: usize,
}

impl Buffer {
    fn with_limit(limit: usize) -> Self {
        Self {
            data: Vec::with_capacity(limit),
            limit,
        }
    }

    fn has_room(&self) -> bool {
        self.data.len() < self.limit
    }

    fn push(&mut self, record: &[u8]) {
        self.data.extend_from_slice(record);
    }

    fn clear(&mut self) {
        self.data.clear();
    }
}

#[derive(Debug)]
struct SinkState {
    current: Buffer,
    next: Option<Buffer>,
    full: Vec<Buffer>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<SinkState>,
    ready: Condvar,
    running: AtomicBool,
    path: PathBuf,
    options: LogOptions,
}

/// Double-buffered log sink with a dedicated writer thread.
///
/// One instance per log file. The process-wide instance writing
/// `server.log` comes from [`AsyncLog::global`]; teardown is an explicit
/// [`stop`](AsyncLog::stop), which drains everything producers queued and
/// joins the writer.
#[derive(Debug)]
pub struct AsyncLog {
    shared: Arc<Shared>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncLog {
    /// Opens (or creates) `path` in append mode and spawns the writer.
    pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        Self::with_options(path, LogOptions::default())
    }

    /// As [`new`](Self::new), with explicit tuning.
    pub fn with_options(path: impl Into<PathBuf>, options: LogOptions) -> io::Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let limit = options.buffer_capacity;
        let shared = Arc::new(Shared {
            state: Mutex::new(SinkState {
                current: Buffer::with_limit(limit),
                next: Some(Buffer::with_limit(limit)),
                full: Vec::with_capacity(16),
            }),
            ready: Condvar::new(),
            running: AtomicBool::new(true),
            path,
            options,
        });

        let writer = thread::Builder::new().name("log-writer".into()).spawn({
            let shared = Arc::clone(&shared);
            move || writer_loop(&shared, file)
        })?;

        Ok(Self {
            shared,
            writer: Mutex::new(Some(writer)),
        })
    }

    /// The lazily-created process-wide sink writing `server.log`.
    ///
    /// Concurrent first use is safe; every caller gets the same instance.
    pub fn global() -> io::Result<&'static AsyncLog> {
        if let Some(sink) = GLOBAL.get() {
            return Ok(sink);
        }
        let sink = AsyncLog::new(DEFAULT_PATH)?;
        Ok(GLOBAL.get_or_init(|| sink))
    }

    /// Queues one pre-formatted record.
    ///
    /// O(1) under the sink mutex: append into the current buffer, or roll
    /// buffers and signal the writer when the current one is full. Never
    /// performs file I/O.
    pub fn append(&self, record: &str) {
        let mut state = self.shared.state.lock().unwrap();

        if state.current.has_room() {
            state.current.push(record.as_bytes());
        } else {
            let next = state
                .next
                .take()
                .unwrap_or_else(|| Buffer::with_limit(self.shared.options.buffer_capacity));
            let full = mem::replace(&mut state.current, next);
            state.full.push(full);
            state.current.push(record.as_bytes());
            self.shared.ready.notify_one();
        }
    }

    /// Stops the writer, draining every queued record first. Idempotent.
    ///
    /// Records appended after `stop` returns accumulate in memory and are
    /// never written.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.ready.notify_one();

        let writer = self.writer.lock().unwrap().take();
        if let Some(writer) = writer {
            let _ = writer.join();
        }
    }
}

impl Drop for AsyncLog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn writer_loop(shared: &Shared, mut file: File) {
    let limit = shared.options.buffer_capacity;
    let mut spare_a = Some(Buffer::with_limit(limit));
    let mut spare_b = Some(Buffer::with_limit(limit));
    let mut to_write: Vec<Buffer> = Vec::with_capacity(16);
    let mut written = file.metadata().map(|m| m.len()).unwrap_or(0);

    while shared.running.load(Ordering::Acquire) {
        {
            let mut state = shared.state.lock().unwrap();
            if state.full.is_empty() {
                let (guard, _timed_out) = shared
                    .ready
                    .wait_timeout(state, shared.options.flush_interval)
                    .unwrap();
                state = guard;
            }

            // Unconditional roll: whatever accumulated in `current` ships
            // this pass, full or not.
            let current = mem::replace(
                &mut state.current,
                spare_a.take().unwrap_or_else(|| Buffer::with_limit(limit)),
            );
            state.full.push(current);
            mem::swap(&mut to_write, &mut state.full);

            if state.next.is_none() {
                state.next = spare_b.take();
            }
        }

        if to_write.len() > MAX_QUEUED_BUFFERS {
            shed_backlog(&mut to_write);
        }

        written += write_buffers(&mut file, &to_write);
        if written > shared.options.rotate_bytes {
            rotate(&mut file, &shared.path);
            written = 0;
        }
        let _ = file.flush();

        if spare_a.is_none() {
            spare_a = reclaim(&mut to_write);
        }
        if spare_b.is_none() {
            spare_b = reclaim(&mut to_write);
        }
        to_write.clear();
    }

    // Drain whatever producers queued before the stop was observed.
    let remaining = {
        let mut state = shared.state.lock().unwrap();
        let current = mem::replace(&mut state.current, Buffer::with_limit(limit));
        let mut remaining = mem::take(&mut state.full);
        remaining.push(current);
        remaining
    };
    write_buffers(&mut file, &remaining);
    let _ = file.flush();
}

/// Sustained backlog: the producers outran the writer. Keep the two oldest
/// buffers and drop the rest rather than blocking producers.
fn shed_backlog(buffers: &mut Vec<Buffer>) {
    buffers.truncate(2);
}

fn write_buffers(file: &mut File, buffers: &[Buffer]) -> u64 {
    let mut written = 0;
    for buffer in buffers {
        if buffer.data.is_empty() {
            continue;
        }
        if file.write_all(&buffer.data).is_ok() {
            written += buffer.data.len() as u64;
        }
    }
    written
}

/// Moves the live file aside and reopens a fresh one at the same path.
///
/// Buffered data cannot be lost here: rotation runs between buffer batches,
/// after the current batch has been handed to the file. If the reopen
/// fails, writes keep going to the renamed handle and the next pass
/// retries.
fn rotate(file: &mut File, path: &Path) {
    let _ = file.flush();

    let mut rotated = path.as_os_str().to_owned();
    rotated.push(".old");
    let _ = fs::rename(path, PathBuf::from(rotated));

    if let Ok(fresh) = OpenOptions::new().create(true).append(true).open(path) {
        *file = fresh;
    }
}

fn reclaim(to_write: &mut Vec<Buffer>) -> Option<Buffer> {
    to_write.pop().map(|mut buffer| {
        buffer.clear();
        buffer
    })
}
