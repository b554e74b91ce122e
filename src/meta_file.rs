//! Byte-range metadata files.
//!
//! The allocator persists two independent files: the main metadata blob
//! and the rebuild-target segment list. Both go through [`MetaFile`],
//! which offers synchronous positional I/O and asynchronous requests whose
//! completion callback runs on another thread.
//!
//! [`FileStore`] is backed by a regular file and a dedicated I/O worker
//! thread. [`MemFile`] keeps the bytes in memory, optionally holding async
//! requests until the test drives them with [`MemFile::complete_pending`].

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Direction of an I/O request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOpcode {
    Read,
    Write,
}

/// State handed to an async completion callback.
#[derive(Debug)]
pub struct AsyncIoContext {
    pub opcode: IoOpcode,
    pub offset: u64,
    /// Data read, or the buffer that was written.
    pub buffer: Vec<u8>,
    /// Outcome. Check this before trusting `buffer` on reads.
    pub result: io::Result<()>,
}

/// Completion callback for an async request.
pub type IoCallback = Box<dyn FnOnce(AsyncIoContext) + Send + 'static>;

/// An asynchronous read or write.
pub struct AsyncIoRequest {
    pub opcode: IoOpcode,
    pub offset: u64,
    pub buffer: Vec<u8>,
    pub callback: IoCallback,
}

impl AsyncIoRequest {
    /// Read `len` bytes at `offset`.
    pub fn read(
        offset: u64,
        len: usize,
        callback: impl FnOnce(AsyncIoContext) + Send + 'static,
    ) -> Self {
        Self {
            opcode: IoOpcode::Read,
            offset,
            buffer: vec![0; len],
            callback: Box::new(callback),
        }
    }

    /// Write `buffer` at `offset`.
    pub fn write(
        offset: u64,
        buffer: Vec<u8>,
        callback: impl FnOnce(AsyncIoContext) + Send + 'static,
    ) -> Self {
        Self {
            opcode: IoOpcode::Write,
            offset,
            buffer,
            callback: Box::new(callback),
        }
    }

    fn complete(self, result: io::Result<()>) {
        let Self {
            opcode,
            offset,
            buffer,
            callback,
        } = self;
        callback(AsyncIoContext {
            opcode,
            offset,
            buffer,
            result,
        });
    }
}

/// A metadata file.
pub trait MetaFile: Send + Sync {
    fn name(&self) -> &str;

    fn exists(&self) -> bool;

    /// Create (or truncate) the file with `size` zero bytes.
    fn create(&self, size: u64) -> io::Result<()>;

    fn open(&self) -> io::Result<()>;

    fn close(&self) -> io::Result<()>;

    fn is_open(&self) -> bool;

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Submit an asynchronous request. An `Err` here means the request was
    /// not submitted and its callback will never run.
    fn async_io(&self, request: AsyncIoRequest) -> io::Result<()>;
}

fn not_open(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        format!("meta file {name} is not open"),
    )
}

fn execute(file: &mut File, opcode: IoOpcode, offset: u64, buffer: &mut [u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    match opcode {
        IoOpcode::Read => file.read_exact(buffer),
        IoOpcode::Write => {
            file.write_all(buffer)?;
            file.sync_data()
        }
    }
}

struct Worker {
    tx: Sender<AsyncIoRequest>,
    handle: JoinHandle<()>,
}

/// A [`MetaFile`] on the local filesystem.
pub struct FileStore {
    name: String,
    path: PathBuf,
    file: Arc<Mutex<Option<File>>>,
    worker: Mutex<Option<Worker>>,
}

impl FileStore {
    /// A store for `dir/name`. Nothing is touched on disk until
    /// [`create`](MetaFile::create) or [`open`](MetaFile::open).
    pub fn new(dir: impl AsRef<Path>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            path: dir.as_ref().join(&name),
            name,
            file: Arc::new(Mutex::new(None)),
            worker: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn spawn_worker(&self) -> io::Result<Worker> {
        let (tx, rx) = crossbeam_channel::unbounded::<AsyncIoRequest>();
        let file = self.file.clone();
        let name = self.name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("meta-io-{}", self.name))
            .spawn(move || {
                for mut request in rx {
                    let result = {
                        let mut guard = file.lock();
                        match guard.as_mut() {
                            Some(f) => {
                                execute(f, request.opcode, request.offset, &mut request.buffer)
                            }
                            None => Err(not_open(&name)),
                        }
                    };
                    if let Err(e) = &result {
                        warn!(file = %name, offset = request.offset, "async meta I/O failed: {e}");
                    }
                    request.complete(result);
                }
                debug!(file = %name, "meta I/O worker stopped");
            })?;
        Ok(Worker { tx, handle })
    }
}

impl MetaFile for FileStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn create(&self, size: u64) -> io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        file.set_len(size)?;
        debug!(file = %self.name, size, "meta file created");
        Ok(())
    }

    fn open(&self) -> io::Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        *self.file.lock() = Some(file);
        *worker = Some(self.spawn_worker()?);
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        let worker = self.worker.lock().take();
        if let Some(Worker { tx, handle }) = worker {
            // queued requests are drained before the worker exits
            drop(tx);
            if handle.thread().id() == std::thread::current().id() {
                // closed from a completion callback; the worker exits on its own
                return Ok(());
            }
            if handle.join().is_err() {
                return Err(io::Error::other("meta I/O worker panicked"));
            }
        }
        *self.file.lock() = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.file.lock().is_some()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or_else(|| not_open(&self.name))?;
        execute(file, IoOpcode::Read, offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or_else(|| not_open(&self.name))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        file.sync_data()
    }

    fn async_io(&self, request: AsyncIoRequest) -> io::Result<()> {
        let worker = self.worker.lock();
        let worker = worker.as_ref().ok_or_else(|| not_open(&self.name))?;
        worker
            .tx
            .send(request)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "meta I/O worker gone"))
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct MemInner {
    name: String,
    data: Mutex<Option<Vec<u8>>>,
    open: AtomicBool,
    deferred: AtomicBool,
    fail_writes: AtomicBool,
    pending: Mutex<VecDeque<AsyncIoRequest>>,
}

/// An in-memory [`MetaFile`].
///
/// Clones share the same bytes, so dropping an allocator and building a
/// new one from a clone behaves like a restart.
#[derive(Clone)]
pub struct MemFile {
    inner: Arc<MemInner>,
}

impl MemFile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MemInner {
                name: name.into(),
                data: Mutex::new(None),
                open: AtomicBool::new(false),
                deferred: AtomicBool::new(false),
                fail_writes: AtomicBool::new(false),
                pending: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Hold async requests until [`complete_pending`](Self::complete_pending).
    /// Otherwise they complete inline, before `async_io` returns.
    pub fn set_deferred(&self, deferred: bool) {
        self.inner.deferred.store(deferred, Ordering::Release);
    }

    /// Make every write, sync or async, fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::Release);
    }

    /// Run held async requests in submission order. Returns how many ran.
    pub fn complete_pending(&self) -> usize {
        let mut count = 0;
        loop {
            let request = self.inner.pending.lock().pop_front();
            let Some(mut request) = request else {
                return count;
            };
            let result = self.execute(request.opcode, request.offset, &mut request.buffer);
            request.complete(result);
            count += 1;
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Copy of the current contents.
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.inner.data.lock().clone()
    }

    fn execute(&self, opcode: IoOpcode, offset: u64, buffer: &mut [u8]) -> io::Result<()> {
        if !self.is_open() {
            return Err(not_open(&self.inner.name));
        }
        let mut data = self.inner.data.lock();
        let data = data
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "meta file not created"))?;
        let start = offset as usize;
        let end = start + buffer.len();
        match opcode {
            IoOpcode::Read => {
                if end > data.len() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "read past end of meta file",
                    ));
                }
                buffer.copy_from_slice(&data[start..end]);
            }
            IoOpcode::Write => {
                if self.inner.fail_writes.load(Ordering::Acquire) {
                    return Err(io::Error::other("injected write failure"));
                }
                if end > data.len() {
                    data.resize(end, 0);
                }
                data[start..end].copy_from_slice(buffer);
            }
        }
        Ok(())
    }
}

impl MetaFile for MemFile {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn exists(&self) -> bool {
        self.inner.data.lock().is_some()
    }

    fn create(&self, size: u64) -> io::Result<()> {
        *self.inner.data.lock() = Some(vec![0; size as usize]);
        Ok(())
    }

    fn open(&self) -> io::Result<()> {
        if !self.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("meta file {} does not exist", self.inner.name),
            ));
        }
        self.inner.open.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        self.inner.open.store(false, Ordering::Release);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.execute(IoOpcode::Read, offset, buf)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut copy = buf.to_vec();
        self.execute(IoOpcode::Write, offset, &mut copy)
    }

    fn async_io(&self, mut request: AsyncIoRequest) -> io::Result<()> {
        if !self.is_open() {
            return Err(not_open(&self.inner.name));
        }
        if self.inner.deferred.load(Ordering::Acquire) {
            self.inner.pending.lock().push_back(request);
            return Ok(());
        }
        let result = self.execute(request.opcode, request.offset, &mut request.buffer);
        request.complete(result);
        Ok(())
    }
}
