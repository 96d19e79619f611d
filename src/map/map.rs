use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::runtime::Handle;

use super::flush;
use super::state::MapState;
use super::KeyValuePair;
use crate::buffer::{MapGuard, MmapBuffer};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::flock::FileLock;
use crate::meta::{Meta, INIT_ROOT_OFFSET, META_END_AT, META_ROOT_AT, META_SIZE, META_VERSION_AT};
use crate::node::{codec, ChildRef, INode, LNode};
use crate::{errcorrupt, errinput};

/// A persistent key-value map over a single memory-mapped file.
///
/// The file holds a copy-on-write byte-prefix trie; every mutation appends
/// a fresh path and publishes it by storing a new root offset into the
/// metadata region. Readers follow offsets through immutable bytes and
/// never block writers; writers serialize only at publication. A
/// background task (spawned when a tokio runtime is ambient at open)
/// flushes the mapping after each publication; `close` always flushes
/// synchronously.
#[derive(Debug)]
pub struct CinderMap {
    pub(super) config: Config,
    pub(super) buffer: Arc<MmapBuffer>,
    pub(super) state: Arc<MapState>,
    _lock: FileLock,
}

/// Outcome of one publication attempt.
enum Publish {
    /// The new path is visible to readers.
    Done,
    /// Another mutation or a resize won the race; rebuild and retry.
    Contended,
    /// The path does not fit; grow the mapping to at least this size.
    NeedsGrow(u64),
}

impl CinderMap {
    /// Open the map at `path` with default configuration, creating and
    /// initializing the file if it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(Config::new(path))
    }

    /// Open the map with custom configuration.
    pub fn open_with_config(config: Config) -> Result<Self> {
        let lock = FileLock::acquire(&config.path)?;

        let (buffer, created) = MmapBuffer::open(&config.path, config.initial_capacity)?;
        let buffer = Arc::new(buffer);

        if created {
            tracing::info!(path = %config.path.display(), "initializing map file");
            Self::init_file(&buffer)?;
        } else {
            let map = buffer.map();
            let meta = Meta::decode(map.slice(0, META_SIZE)?)?;
            meta.validate(map.len())?;
        }

        let (state, flush_rx) = MapState::new();
        let state = Arc::new(state);

        // The durability worker needs an ambient tokio runtime; without
        // one it is skipped and durability degrades to the close-time
        // flush.
        if let Ok(handle) = Handle::try_current() {
            let worker = flush::spawn(
                &handle,
                Arc::clone(&buffer),
                Arc::clone(&state),
                flush_rx,
                state.subscribe_shutdown(),
            );
            state.set_flusher(worker);
        }

        Ok(Self {
            config,
            buffer,
            state,
            _lock: lock,
        })
    }

    /// Seed a fresh file: the version-0 empty root at offset 24, then the
    /// metadata triple pointing at it.
    fn init_file(buffer: &MmapBuffer) -> Result<()> {
        let map = buffer.map();

        let mut root = INode::empty(0);
        let root_bytes = codec::serialize_path(&mut root, INIT_ROOT_OFFSET);
        map.write(INIT_ROOT_OFFSET, &root_bytes)?;

        let meta = Meta {
            version: 0,
            root_offset: INIT_ROOT_OFFSET,
            end_offset: INIT_ROOT_OFFSET + root_bytes.len() as u64,
        };
        map.write(0, &meta.encode())?;
        map.flush_region(0, meta.end_offset - 1)?;
        Ok(())
    }

    /// Insert or update a key-value pair. Returns true once the new
    /// version is published; contention with other writers is retried
    /// internally.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        validate_key(key)?;

        loop {
            self.state.wait_while_resizing();

            let outcome = {
                let map = self.buffer.map();
                let meta = Meta::snapshot(&map);
                if meta.version == u64::MAX {
                    return errcorrupt!("version counter exhausted");
                }

                let mut root = codec::read_inode(&map, meta.root_offset)?;
                root.version = meta.version + 1;
                put_path(&map, &mut root, key, value, 0)?;

                self.publish(&map, meta.version, &mut root)?
            };

            match outcome {
                Publish::Done => {
                    self.state.signal_flush();
                    return Ok(true);
                }
                Publish::Contended => std::thread::yield_now(),
                Publish::NeedsGrow(min_required) => self.grow_or_wait(min_required)?,
            }
        }
    }

    /// Retrieve the value for a key, with the version of the mutation
    /// that wrote it.
    pub fn get(&self, key: &[u8]) -> Result<Option<KeyValuePair>> {
        self.ensure_open()?;
        validate_key(key)?;

        let map = self.buffer.map();
        let root_offset = map.atomic_u64(META_ROOT_AT).load(Ordering::Acquire);
        let mut node = codec::read_inode(&map, root_offset)?;

        for &byte in key {
            if !node.bitmap.is_set(byte) {
                return Ok(None);
            }
            let pos = node.bitmap.position(byte);
            node = codec::read_inode(&map, node.child_offset(pos))?;
        }

        match node.leaf {
            Some(leaf) if !leaf.is_vacant() && leaf.key == key => Ok(Some(KeyValuePair {
                version: leaf.version,
                key: leaf.key,
                value: leaf.value,
            })),
            _ => Ok(None),
        }
    }

    /// Delete a key. Returns true when the key existed and a new version
    /// was published, false when there was nothing to delete.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        validate_key(key)?;

        loop {
            self.state.wait_while_resizing();

            let outcome = {
                let map = self.buffer.map();
                let meta = Meta::snapshot(&map);
                if meta.version == u64::MAX {
                    return errcorrupt!("version counter exhausted");
                }

                let mut root = codec::read_inode(&map, meta.root_offset)?;
                root.version = meta.version + 1;
                if !delete_path(&map, &mut root, key, 0)? {
                    // Nothing changed; the path copy is discarded and no
                    // version is published.
                    return Ok(false);
                }

                self.publish(&map, meta.version, &mut root)?
            };

            match outcome {
                Publish::Done => {
                    self.state.signal_flush();
                    return Ok(true);
                }
                Publish::Contended => std::thread::yield_now(),
                Publish::NeedsGrow(min_required) => self.grow_or_wait(min_required)?,
            }
        }
    }

    /// Serialize a finished path copy and make it visible.
    ///
    /// Order matters for readers that observe the metadata fields
    /// independently: the version CAS claims the mutation, the end offset
    /// reserves the append region, the node bytes land, and only then is
    /// the root offset published. Any reader that sees the new root
    /// therefore sees fully serialized bytes.
    fn publish(&self, map: &MapGuard, snapshot_version: u64, root: &mut INode) -> Result<Publish> {
        if self.state.is_resizing() {
            return Ok(Publish::Contended);
        }

        let _publish = self.state.publish_lock.lock();

        let version = map.atomic_u64(META_VERSION_AT);
        if version.load(Ordering::Acquire) != snapshot_version {
            return Ok(Publish::Contended);
        }

        let end = map.atomic_u64(META_END_AT).load(Ordering::Acquire);
        let bytes = codec::serialize_path(root, end);
        let new_end = end + bytes.len() as u64;
        if new_end > map.len() {
            return Ok(Publish::NeedsGrow(new_end));
        }

        if version
            .compare_exchange(
                snapshot_version,
                snapshot_version + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Ok(Publish::Contended);
        }

        map.atomic_u64(META_END_AT).store(new_end, Ordering::Release);
        if let Err(e) = map.write(end, &bytes) {
            // Roll the claim back; the previous root is untouched.
            map.atomic_u64(META_END_AT).store(end, Ordering::Release);
            version.store(snapshot_version, Ordering::Release);
            return Err(e);
        }
        map.atomic_u64(META_ROOT_AT)
            .store(root.start_offset, Ordering::Release);

        Ok(Publish::Done)
    }

    /// Run the growth ourselves or wait for the writer that beat us to
    /// it, then let the caller retry.
    fn grow_or_wait(&self, min_required: u64) -> Result<()> {
        match self.state.try_begin_resize() {
            Some(_resize) => self.buffer.grow(min_required, &self.config),
            None => {
                self.state.wait_while_resizing();
                Ok(())
            }
        }
    }

    /// Size of the backing file in bytes.
    pub fn file_size(&self) -> Result<u64> {
        self.ensure_open()?;
        self.buffer.file_size()
    }

    /// Snapshot of the map's metadata for monitoring and tests.
    pub fn status(&self) -> Result<Status> {
        self.ensure_open()?;

        let map = self.buffer.map();
        let meta = Meta::snapshot(&map);
        Ok(Status {
            version: meta.version,
            root_offset: meta.root_offset,
            end_offset: meta.end_offset,
            mapped_len: map.len(),
            file_size: self.buffer.file_size()?,
        })
    }

    /// Stop the durability worker, drain any in-flight publication, and
    /// flush the mapping. Further operations return [`Error::Closed`].
    /// Safe to call more than once.
    pub async fn close(&self) -> Result<()> {
        if !self.state.close_once() {
            return Ok(());
        }

        self.state.signal_shutdown();
        if let Some(worker) = self.state.take_flusher() {
            worker.await?;
        }

        drop(self.state.publish_lock.lock());
        self.buffer.map().flush_all()
    }

    /// Close the map and delete the backing file.
    pub async fn remove(&self) -> Result<()> {
        self.close().await?;

        std::fs::remove_file(&self.config.path)?;
        let _ = std::fs::remove_file(FileLock::lock_path(&self.config.path));
        Ok(())
    }

    pub(super) fn ensure_open(&self) -> Result<()> {
        if self.state.is_open() {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }
}

impl Drop for CinderMap {
    fn drop(&mut self) {
        if self.state.close_once() {
            self.state.signal_shutdown();
            if let Some(worker) = self.state.take_flusher() {
                worker.abort();
            }
            let _ = self.buffer.map().flush_all();
        }
    }
}

/// Extend the path copy down to the key's terminal level and attach a
/// fresh leaf there. Existing nodes along the way are copied with the
/// mutation's version; missing branches are created empty.
fn put_path(map: &MapGuard, node: &mut INode, key: &[u8], value: &[u8], level: usize) -> Result<()> {
    if level == key.len() {
        node.leaf = Some(LNode::new(key, value, node.version));
        return Ok(());
    }

    let index = key[level];
    if !node.bitmap.is_set(index) {
        node.bitmap.set(index);
        let pos = node.bitmap.position(index);

        let mut branch = INode::empty(node.version);
        put_path(map, &mut branch, key, value, level + 1)?;
        node.children.insert(pos, ChildRef::Live(Box::new(branch)));
        return Ok(());
    }

    let pos = node.bitmap.position(index);
    let child = materialize_child(map, node, pos)?;
    put_path(map, child, key, value, level + 1)
}

/// Walk the path copy towards the key; when the attached leaf matches,
/// vacate the slot with a tombstone and collapse branches that became
/// empty on the way back up. Returns whether anything changed.
fn delete_path(map: &MapGuard, node: &mut INode, key: &[u8], level: usize) -> Result<bool> {
    if level == key.len() {
        return Ok(match &node.leaf {
            Some(leaf) if !leaf.is_vacant() && leaf.key == key => {
                node.leaf = Some(LNode::tombstone(node.version));
                true
            }
            _ => false,
        });
    }

    let index = key[level];
    if !node.bitmap.is_set(index) {
        return Ok(false);
    }
    let pos = node.bitmap.position(index);

    let collapse = {
        let child = materialize_child(map, node, pos)?;
        if !delete_path(map, child, key, level + 1)? {
            return Ok(false);
        }
        child.is_empty_subtree()
    };

    if collapse {
        node.bitmap.clear(index);
        node.children.remove(pos);
    }
    Ok(true)
}

/// Bring the child at `pos` into the path copy: an on-disk sibling is
/// read and re-stamped with the mutation's version; a child already
/// copied by this mutation is reused.
fn materialize_child<'n>(map: &MapGuard, node: &'n mut INode, pos: usize) -> Result<&'n mut INode> {
    let version = node.version;

    if let ChildRef::Disk(offset) = node.children[pos] {
        let child = codec::read_inode(map, offset)?;
        node.children[pos] = ChildRef::Live(Box::new(child));
    }

    match &mut node.children[pos] {
        ChildRef::Live(child) => {
            child.version = version;
            Ok(child)
        }
        ChildRef::Disk(_) => errcorrupt!("child copy missing after materialization"),
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return errinput!("key must not be empty");
    }
    if key.len() > u16::MAX as usize {
        return errinput!("key length {} exceeds maximum {}", key.len(), u16::MAX);
    }
    Ok(())
}

/// Metadata snapshot for monitoring and debugging.
#[derive(Debug, Clone)]
pub struct Status {
    pub version: u64,
    pub root_offset: u64,
    pub end_offset: u64,
    pub mapped_len: u64,
    pub file_size: u64,
}
