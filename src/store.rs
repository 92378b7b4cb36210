/*!
Single-slot context store.

One worker thread owns the persistence backend and the slot key. Callers talk
to it through a command channel and get a `Pending` reply handle back, so a
write can be dispatched without waiting (the observer never waits) while a
read can be awaited with a timeout (the retrieval handler does).

Commands are applied in the order they reach the worker; the write that lands
last wins. A failed write leaves the previous value in place.
*/

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};

use crate::errors::StoreError;
use crate::fragment::ContextFragment;

/// Default persisted key holding the most recent fragment.
pub const DEFAULT_SLOT_KEY: &str = "latestContext";

/// Key-value persistence primitive behind the slot.
pub trait SlotBackend: Send + 'static {
    fn load(&mut self, key: &str) -> io::Result<Option<Value>>;
    fn save(&mut self, key: &str, value: &Value) -> io::Result<()>;
}

/// JSON object file; each save atomically replaces the whole file.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileBackend { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_map(&self) -> io::Result<Map<String, Value>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(e),
        };
        if text.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(m)) => Ok(m),
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: expected a json object", self.path.display()),
            )),
            Err(e) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: {e}", self.path.display()),
            )),
        }
    }
}

impl SlotBackend for FileBackend {
    fn load(&mut self, key: &str) -> io::Result<Option<Value>> {
        Ok(self.read_map()?.remove(key))
    }

    fn save(&mut self, key: &str, value: &Value) -> io::Result<()> {
        // A corrupt file is replaced rather than blocking every future capture.
        let mut map = match self.read_map() {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!(path = %self.path.display(), error = %e, "replacing unreadable state file");
                Map::new()
            }
            Err(e) => return Err(e),
        };
        map.insert(key.to_string(), value.clone());
        let bytes = serde_json::to_vec_pretty(&Value::Object(map))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// In-process backend. Clones share state; failures can be injected.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    slots: Arc<Mutex<HashMap<String, Value>>>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Current raw value under `key`, bypassing the store.
    pub fn peek(&self, key: &str) -> Option<Value> {
        self.slots.lock().ok().and_then(|m| m.get(key).cloned())
    }
}

impl SlotBackend for MemoryBackend {
    fn load(&mut self, key: &str) -> io::Result<Option<Value>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected read failure"));
        }
        let slots = self
            .slots
            .lock()
            .map_err(|_| io::Error::other("memory backend poisoned"))?;
        Ok(slots.get(key).cloned())
    }

    fn save(&mut self, key: &str, value: &Value) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected write failure (quota exceeded)"));
        }
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| io::Error::other("memory backend poisoned"))?;
        slots.insert(key.to_string(), value.clone());
        Ok(())
    }
}

/// Reply handle for a store operation.
///
/// Dropping it is fine: the operation still runs, only the result is lost.
#[derive(Debug)]
pub struct Pending<T> {
    rx: Receiver<Result<T, StoreError>>,
}

impl<T> Pending<T> {
    pub fn wait(self) -> Result<T, StoreError> {
        self.rx.recv().map_err(|_| StoreError::Closed)?
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<T, StoreError> {
        match self.rx.recv_timeout(timeout) {
            Ok(r) => r,
            Err(RecvTimeoutError::Timeout) => Err(StoreError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(StoreError::Closed),
        }
    }

    /// Result if it is already known, without blocking. A command the worker
    /// never received shows up here as `Closed` right away.
    pub fn try_result(&self) -> Option<Result<T, StoreError>> {
        match self.rx.try_recv() {
            Ok(r) => Some(r),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(StoreError::Closed)),
        }
    }
}

type Reply<T> = Sender<Result<T, StoreError>>;

enum Command {
    Set(ContextFragment, Reply<()>),
    Get(Reply<Option<ContextFragment>>),
}

/// Handle to the single-slot store. Cheap to clone; all clones talk to the
/// same worker.
#[derive(Debug, Clone)]
pub struct ContextStore {
    tx: Sender<Command>,
    key: Arc<str>,
}

impl ContextStore {
    /// Spawn the worker owning `backend`. The worker exits once every handle
    /// has been dropped.
    pub fn open<B: SlotBackend>(backend: B, key: &str) -> io::Result<ContextStore> {
        let (tx, rx) = mpsc::channel::<Command>();
        let key: Arc<str> = Arc::from(key);
        let worker_key = key.clone();
        std::thread::Builder::new()
            .name("ctxtap-store".to_string())
            .spawn(move || run_worker(backend, &worker_key, rx))?;
        Ok(ContextStore { tx, key })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Handle whose worker has already exited.
    #[cfg(test)]
    pub(crate) fn closed(key: &str) -> ContextStore {
        let (tx, _) = mpsc::channel::<Command>();
        ContextStore {
            tx,
            key: Arc::from(key),
        }
    }

    /// Overwrite the slot with `fragment`. When the worker is gone the write is
    /// dropped and the reply is `Closed`; callers log it with their own context.
    pub fn set_latest(&self, fragment: ContextFragment) -> Pending<()> {
        let (reply, rx) = mpsc::channel();
        if self.tx.send(Command::Set(fragment, reply)).is_err() {
            tracing::debug!(key = %self.key, "store worker gone; write not queued");
        }
        Pending { rx }
    }

    /// Current slot value, `None` when nothing was captured yet.
    pub fn get_latest(&self) -> Pending<Option<ContextFragment>> {
        let (reply, rx) = mpsc::channel();
        if self.tx.send(Command::Get(reply)).is_err() {
            tracing::warn!(key = %self.key, "store worker gone; read cannot be served");
        }
        Pending { rx }
    }
}

fn run_worker<B: SlotBackend>(mut backend: B, key: &str, rx: Receiver<Command>) {
    tracing::debug!(key, "store worker started");
    for cmd in rx {
        match cmd {
            Command::Set(fragment, reply) => {
                let res = backend
                    .save(key, fragment.as_value())
                    .map_err(|e| StoreError::Write(e.to_string()));
                match &res {
                    Ok(()) => tracing::debug!(key, "slot overwritten"),
                    Err(e) => tracing::error!(key, error = %e, "slot write failed; previous value kept"),
                }
                let _ = reply.send(res);
            }
            Command::Get(reply) => {
                let res = backend
                    .load(key)
                    .map(|v| v.and_then(ContextFragment::from_value))
                    .map_err(|e| StoreError::Read(e.to_string()));
                if let Err(e) = &res {
                    tracing::error!(key, error = %e, "slot read failed");
                }
                let _ = reply.send(res);
            }
        }
    }
    tracing::debug!(key, "store worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frag(v: Value) -> ContextFragment {
        ContextFragment::from_value(v).expect("non-null fragment")
    }

    #[test]
    fn test_empty_store_returns_none() {
        let store = ContextStore::open(MemoryBackend::new(), DEFAULT_SLOT_KEY).expect("open");
        assert_eq!(store.get_latest().wait(), Ok(None));
    }

    #[test]
    fn test_last_write_wins() {
        let store = ContextStore::open(MemoryBackend::new(), DEFAULT_SLOT_KEY).expect("open");
        store.set_latest(frag(json!({"id": "A"}))).wait().expect("set A");
        store.set_latest(frag(json!({"id": "B"}))).wait().expect("set B");
        let got = store.get_latest().wait().expect("get");
        assert_eq!(got.map(|f| f.into_value()), Some(json!({"id": "B"})));
    }

    #[test]
    fn test_fire_and_forget_write_is_visible_to_later_read() {
        let store = ContextStore::open(MemoryBackend::new(), DEFAULT_SLOT_KEY).expect("open");
        drop(store.set_latest(frag(json!([1, 2, 3]))));
        let got = store
            .get_latest()
            .wait_timeout(Duration::from_secs(5))
            .expect("get");
        assert_eq!(got.map(|f| f.into_value()), Some(json!([1, 2, 3])));
    }

    #[test]
    fn test_repeated_reads_are_idempotent() {
        let store = ContextStore::open(MemoryBackend::new(), DEFAULT_SLOT_KEY).expect("open");
        store.set_latest(frag(json!({"x": 1}))).wait().expect("set");
        let a = store.get_latest().wait().expect("first");
        let b = store.get_latest().wait().expect("second");
        assert_eq!(a, b);
        assert!(a.is_some());
    }

    #[test]
    fn test_failed_write_keeps_previous_value() {
        let backend = MemoryBackend::new();
        let store = ContextStore::open(backend.clone(), DEFAULT_SLOT_KEY).expect("open");
        store.set_latest(frag(json!({"id": "A"}))).wait().expect("set A");
        backend.set_fail_writes(true);
        let err = store.set_latest(frag(json!({"id": "B"}))).wait().unwrap_err();
        assert!(matches!(err, StoreError::Write(_)), "got {err:?}");
        backend.set_fail_writes(false);
        let got = store.get_latest().wait().expect("get");
        assert_eq!(got.map(|f| f.into_value()), Some(json!({"id": "A"})));
    }

    #[test]
    fn test_failed_read_is_reported() {
        let backend = MemoryBackend::new();
        let store = ContextStore::open(backend.clone(), DEFAULT_SLOT_KEY).expect("open");
        backend.set_fail_reads(true);
        let err = store.get_latest().wait().unwrap_err();
        assert!(matches!(err, StoreError::Read(_)), "got {err:?}");
    }

    #[test]
    fn test_persisted_null_reads_as_empty() {
        let backend = MemoryBackend::new();
        let mut raw = backend.clone();
        raw.save(DEFAULT_SLOT_KEY, &Value::Null).expect("seed");
        let store = ContextStore::open(backend, DEFAULT_SLOT_KEY).expect("open");
        assert_eq!(store.get_latest().wait(), Ok(None));
    }

    #[test]
    fn test_file_backend_round_trips_and_keeps_other_keys() {
        let td = tempfile::tempdir().expect("tmpdir");
        let path = td.path().join("state").join("state.json");
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(&path, r#"{"unrelated": 7}"#).expect("seed");

        let mut backend = FileBackend::new(&path);
        assert_eq!(backend.load(DEFAULT_SLOT_KEY).expect("load"), None);
        backend
            .save(DEFAULT_SLOT_KEY, &json!({"sessionId": "abc"}))
            .expect("save");

        let mut reopened = FileBackend::new(&path);
        assert_eq!(
            reopened.load(DEFAULT_SLOT_KEY).expect("load"),
            Some(json!({"sessionId": "abc"}))
        );
        assert_eq!(reopened.load("unrelated").expect("load"), Some(json!(7)));
    }

    #[test]
    fn test_file_backend_corrupt_file_is_read_error_but_writable() {
        let td = tempfile::tempdir().expect("tmpdir");
        let path = td.path().join("state.json");
        fs::write(&path, "{not json").expect("seed");

        let mut backend = FileBackend::new(&path);
        let err = backend.load(DEFAULT_SLOT_KEY).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        backend.save(DEFAULT_SLOT_KEY, &json!(1)).expect("save over corrupt");
        assert_eq!(backend.load(DEFAULT_SLOT_KEY).expect("load"), Some(json!(1)));
    }

    #[test]
    fn test_closed_store_reports_closed() {
        let store = ContextStore::closed(DEFAULT_SLOT_KEY);
        assert_eq!(store.get_latest().wait(), Err(StoreError::Closed));
        assert_eq!(
            store.set_latest(frag(json!(1))).wait_timeout(Duration::from_millis(10)),
            Err(StoreError::Closed)
        );
    }

    #[test]
    fn test_try_result_tells_lost_write_from_queued_one() {
        let closed = ContextStore::closed(DEFAULT_SLOT_KEY);
        assert_eq!(
            closed.set_latest(frag(json!(1))).try_result(),
            Some(Err(StoreError::Closed))
        );

        let store = ContextStore::open(MemoryBackend::new(), DEFAULT_SLOT_KEY).expect("open");
        let pending = store.set_latest(frag(json!(2)));
        assert!(!matches!(pending.try_result(), Some(Err(StoreError::Closed))));
    }
}
