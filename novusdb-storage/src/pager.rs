//! Maps page ids to 4096-byte buffers, allocates pages, persists the meta
//! page, and funnels every write through the WAL and (inside a transaction)
//! an undo log. Collection/record/index/view lifecycle and crash recovery
//! all live here, behind the single `Pager` type the query crate drives.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::FileExt as _;
#[cfg(windows)]
use std::os::windows::fs::FileExt as _;

use log::debug;

use crate::cache::PageCache;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::filelock::FileLock;
use crate::index::{encode_sortable_key, BTree};
use crate::lock::{LockManager, LockPolicy};
use crate::page::{Page, PAGE_HEADER_SIZE, PAGE_SIZE, PAGE_TYPE_DATA, PAGE_TYPE_META, PAGE_TYPE_OVERFLOW};
use crate::record::{self, FLAG_ACTIVE, FLAG_COMPRESSED, FLAG_OVERFLOW, RecordLocation};
use crate::wal::Wal;

/// Record payloads larger than this many bytes spill to an overflow chain.
const OVERFLOW_THRESHOLD: usize = PAGE_SIZE - PAGE_HEADER_SIZE - record::SLOT_HEADER_LEN;
const OVERFLOW_PAYLOAD_PER_PAGE: usize = record::OVERFLOW_PAYLOAD_PER_PAGE;

/// Knobs gathered into a single options struct (cache size, lock policy and
/// timeout), the way the teacher's storage layer takes one settings struct
/// into `open`.
#[derive(Debug, Clone)]
pub struct DbOptions {
    pub cache_capacity: usize,
    pub lock_policy: LockPolicy,
    pub lock_timeout: Duration,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            cache_capacity: 1024,
            lock_policy: LockPolicy::Wait,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionMeta {
    pub name: String,
    pub first_page_id: u32,
    pub next_record_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexMeta {
    pub name: Option<String>,
    pub collection: String,
    pub field: String,
    pub root_page_id: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViewMeta {
    pub name: String,
    pub query_text: String,
}

struct Transaction {
    total_pages_snapshot: u32,
    collections_snapshot: Vec<CollectionMeta>,
    indexes_snapshot: Vec<IndexMeta>,
    views_snapshot: Vec<ViewMeta>,
    undo: HashMap<u32, Box<[u8; PAGE_SIZE]>>,
    new_pages: HashSet<u32>,
}

pub struct Pager {
    _lock: FileLock,
    path: PathBuf,
    file: File,
    wal: Wal,
    cache: PageCache,
    total_pages: u32,
    collections: Vec<CollectionMeta>,
    indexes: Vec<IndexMeta>,
    views: Vec<ViewMeta>,
    locks: Arc<LockManager>,
    tx: Option<Transaction>,
}

impl Pager {
    pub fn open(path: impl AsRef<Path>, options: DbOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let lock = FileLock::acquire(&path)?;
        let is_new = std::fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let wal = Wal::open(&wal_path_for(&path))?;

        let mut pager = Self {
            _lock: lock,
            path,
            file,
            wal,
            cache: PageCache::new(options.cache_capacity),
            total_pages: if is_new { 1 } else { 0 },
            collections: Vec::new(),
            indexes: Vec::new(),
            views: Vec::new(),
            locks: Arc::new(LockManager::with_timeout(options.lock_policy, options.lock_timeout)),
            tx: None,
        };

        if is_new {
            pager.write_page_physical(0, &[0u8; PAGE_SIZE])?;
            pager.flush_meta()?;
        } else {
            pager.recover()?;
            let meta_bytes = pager.read_page_physical(0)?;
            pager.load_meta(&meta_bytes)?;
        }

        Ok(pager)
    }

    /// Replays every committed page write recorded in the WAL into the data
    /// file, then truncates the WAL. A no-op if nothing was pending.
    fn recover(&mut self) -> Result<()> {
        let committed = self.wal.committed_page_writes()?;
        if committed.is_empty() {
            return Ok(());
        }
        debug!("replaying {} committed wal page writes", committed.len());
        for (page_id, bytes) in &committed {
            let mut buf = [0u8; PAGE_SIZE];
            buf.copy_from_slice(bytes);
            self.write_page_physical(*page_id, &buf)?;
            self.total_pages = self.total_pages.max(page_id + 1);
        }
        self.file.sync_data()?;
        self.wal.truncate()?;
        Ok(())
    }

    // ---- low-level page I/O ----------------------------------------------

    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.stats()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_page(&self, id: u32) -> Result<Page> {
        if id >= self.total_pages {
            return Err(Error::OutOfRange(format!("page {id}")));
        }
        if let Some(buf) = self.cache.get(id) {
            return Ok(Page { buf });
        }
        let bytes = self.read_page_physical(id)?;
        let buf = Box::new(bytes);
        self.cache.put(id, buf.clone());
        Ok(Page { buf })
    }

    /// Reads bypassing the cache; used for the `NO_CACHE` statement hint.
    pub fn read_page_uncached(&self, id: u32) -> Result<Page> {
        if id >= self.total_pages {
            return Err(Error::OutOfRange(format!("page {id}")));
        }
        Ok(Page {
            buf: Box::new(self.read_page_physical(id)?),
        })
    }

    pub fn write_page(&mut self, page: &Page) -> Result<()> {
        let id = page.page_id();
        if let Some(tx) = self.tx.as_mut() {
            if !tx.undo.contains_key(&id) && !tx.new_pages.contains(&id) {
                let before = read_page_raw(&self.file, id)?;
                tx.undo.insert(id, Box::new(before));
            }
        }
        self.wal.log_page_write(id, &page.buf)?;
        write_page_raw(&self.file, id, &page.buf)?;
        self.cache.put(id, page.buf.clone());
        Ok(())
    }

    pub fn allocate_page(&mut self, page_type: u8) -> Result<u32> {
        let id = self.total_pages;
        self.total_pages += 1;
        if let Some(tx) = self.tx.as_mut() {
            tx.new_pages.insert(id);
        }
        let page = Page::zeroed(page_type, id);
        self.write_page(&page)?;
        self.flush_meta()?;
        Ok(id)
    }

    fn read_page_physical(&self, id: u32) -> Result<[u8; PAGE_SIZE]> {
        read_page_raw(&self.file, id)
    }

    fn write_page_physical(&mut self, id: u32, bytes: &[u8; PAGE_SIZE]) -> Result<()> {
        write_page_raw(&self.file, id, bytes)
    }

    // ---- meta page ----------------------------------------------------

    fn flush_meta(&mut self) -> Result<()> {
        let mut page = Page::zeroed(PAGE_TYPE_META, 0);
        encode_meta(&mut page, self.total_pages, &self.collections, &self.indexes, &self.views)?;
        self.write_page(&page)
    }

    fn load_meta(&mut self, bytes: &[u8; PAGE_SIZE]) -> Result<()> {
        let (total_pages, collections, indexes, views) = decode_meta(bytes)?;
        self.total_pages = total_pages;
        self.collections = collections;
        self.indexes = indexes;
        self.views = views;
        Ok(())
    }

    // ---- collections ----------------------------------------------------

    pub fn collections(&self) -> &[CollectionMeta] {
        &self.collections
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionMeta> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn collection_exists(&self, name: &str) -> bool {
        self.collection(name).is_some()
    }

    pub fn ensure_collection(&mut self, name: &str) -> Result<()> {
        if self.collection_exists(name) {
            return Ok(());
        }
        self.collections.push(CollectionMeta {
            name: name.to_string(),
            first_page_id: 0,
            next_record_id: 1,
        });
        self.flush_meta()
    }

    pub fn drop_collection(&mut self, name: &str, if_exists: bool) -> Result<()> {
        let pos = self.collections.iter().position(|c| c.name == name);
        match pos {
            Some(pos) => {
                self.collections.remove(pos);
                self.indexes.retain(|i| i.collection != name);
                self.flush_meta()
            }
            None if if_exists => Ok(()),
            None => Err(Error::UnknownCollection(name.to_string())),
        }
    }

    pub fn truncate_collection(&mut self, name: &str) -> Result<u64> {
        let rows = self.scan_collection(name)?;
        let mut count = 0u64;
        for (loc, _) in rows {
            self.mark_deleted(loc)?;
            count += 1;
        }
        Ok(count)
    }

    // ---- record lifecycle -------------------------------------------------

    pub fn insert_record(&mut self, collection: &str, bytes: &[u8]) -> Result<RecordLocation> {
        self.ensure_collection(collection)?;
        let record_id = {
            let c = self.collections.iter_mut().find(|c| c.name == collection).unwrap();
            let id = c.next_record_id;
            c.next_record_id += 1;
            id
        };
        self.flush_meta()?;
        self.insert_record_with_id(collection, record_id, bytes)
    }

    fn insert_record_with_id(&mut self, collection: &str, record_id: u64, bytes: &[u8]) -> Result<RecordLocation> {
        let (payload, flags) = self.encode_record_payload(bytes)?;
        self.place_slot(collection, record_id, &payload, flags)
    }

    /// Builds the bytes and flags that should land in a data-page slot for
    /// `bytes`: either the (optionally snappy-compressed) inline payload, or
    /// an 8-byte overflow pointer after spilling to an overflow chain.
    fn encode_record_payload(&mut self, bytes: &[u8]) -> Result<(Vec<u8>, u8)> {
        if bytes.len() > OVERFLOW_THRESHOLD {
            let first_page = self.write_overflow_chain(bytes)?;
            let pointer = record::encode_overflow_payload(bytes.len() as u32, first_page);
            Ok((pointer.to_vec(), FLAG_OVERFLOW))
        } else if let Some(compressed) = record::try_compress(bytes) {
            Ok((compressed, FLAG_COMPRESSED))
        } else {
            Ok((bytes.to_vec(), FLAG_ACTIVE))
        }
    }

    fn write_overflow_chain(&mut self, bytes: &[u8]) -> Result<u32> {
        let chunks: Vec<&[u8]> = if bytes.is_empty() {
            vec![&bytes[..]]
        } else {
            bytes.chunks(OVERFLOW_PAYLOAD_PER_PAGE).collect()
        };
        let mut page_ids = Vec::with_capacity(chunks.len());
        for _ in &chunks {
            page_ids.push(self.allocate_page(PAGE_TYPE_OVERFLOW)?);
        }
        for (i, chunk) in chunks.iter().enumerate() {
            let id = page_ids[i];
            let mut page = Page::zeroed(PAGE_TYPE_OVERFLOW, id);
            let next = if i + 1 < page_ids.len() { page_ids[i + 1] } else { 0 };
            page.set_next_page_id(next);
            page.body_mut()[..chunk.len()].copy_from_slice(chunk);
            self.write_page(&page)?;
        }
        Ok(page_ids[0])
    }

    fn read_overflow_chain(&self, total_len: u32, first_page: u32) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(total_len as usize);
        let mut page_id = first_page;
        while out.len() < total_len as usize {
            let page = self.read_page(page_id)?;
            let remaining = total_len as usize - out.len();
            let take = remaining.min(OVERFLOW_PAYLOAD_PER_PAGE);
            out.extend_from_slice(&page.body()[..take]);
            let next = page.next_page_id();
            if next == 0 {
                break;
            }
            page_id = next;
        }
        Ok(out)
    }

    /// Walks a collection's page chain looking for room; allocates and
    /// links a fresh data page at the tail if none fits.
    fn place_slot(&mut self, collection: &str, record_id: u64, payload: &[u8], flags: u8) -> Result<RecordLocation> {
        let needed = record::required_len(payload.len());
        let first_page_id = self.collection(collection).unwrap().first_page_id;

        if first_page_id == 0 {
            let new_id = self.allocate_page(PAGE_TYPE_DATA)?;
            {
                let c = self.collections.iter_mut().find(|c| c.name == collection).unwrap();
                c.first_page_id = new_id;
            }
            self.flush_meta()?;
            let mut new_page = self.read_page(new_id)?;
            let off = record::append_slot(&mut new_page, record_id, payload, flags);
            self.write_page(&new_page)?;
            return Ok(RecordLocation {
                record_id,
                page_id: new_id,
                slot_offset: off,
            });
        }

        let mut page_id = first_page_id;
        loop {
            let mut page = self.read_page(page_id)?;
            if page.free_space() >= needed {
                let off = record::append_slot(&mut page, record_id, payload, flags);
                self.write_page(&page)?;
                return Ok(RecordLocation {
                    record_id,
                    page_id,
                    slot_offset: off,
                });
            }
            let next = page.next_page_id();
            if next == 0 {
                break;
            }
            page_id = next;
        }

        let new_id = self.allocate_page(PAGE_TYPE_DATA)?;
        let mut tail = self.read_page(page_id)?;
        tail.set_next_page_id(new_id);
        self.write_page(&tail)?;
        let mut new_page = self.read_page(new_id)?;
        let off = record::append_slot(&mut new_page, record_id, payload, flags);
        self.write_page(&new_page)?;
        Ok(RecordLocation {
            record_id,
            page_id: new_id,
            slot_offset: off,
        })
    }

    /// Overwrites in place if the new on-disk encoding is the same size as
    /// the old one (true for any inline payload of matching length, and
    /// always true comparing one overflow pointer against another since the
    /// pointer itself is a fixed 8 bytes); otherwise tombstones the old slot
    /// and re-inserts under the same record id.
    pub fn update_record(&mut self, collection: &str, loc: RecordLocation, bytes: &[u8]) -> Result<RecordLocation> {
        let (payload, new_flags) = self.encode_record_payload(bytes)?;
        let page = self.read_page(loc.page_id)?;
        let old_len = slot_data_len_at(&page, loc.slot_offset);

        if payload.len() == old_len as usize {
            let mut page = page;
            record::overwrite_payload_at(&mut page, loc.slot_offset, &payload);
            record::set_flags_at(&mut page, loc.slot_offset, new_flags);
            self.write_page(&page)?;
            Ok(loc)
        } else {
            self.mark_deleted(loc)?;
            self.insert_record_with_id(collection, loc.record_id, bytes)
        }
    }

    pub fn mark_deleted(&mut self, loc: RecordLocation) -> Result<()> {
        let mut page = self.read_page(loc.page_id)?;
        let flags = slot_flags_at(&page, loc.slot_offset);
        record::set_flags_at(&mut page, loc.slot_offset, record::deleted_variant_of(flags));
        self.write_page(&page)
    }

    fn resolve_bytes(&self, page: &Page, slot: &record::SlotView) -> Result<Vec<u8>> {
        let payload = record::slot_payload(page, slot);
        if record::is_overflow(slot.flags) {
            let (total_len, first_page) = record::decode_overflow_payload(payload);
            let raw = self.read_overflow_chain(total_len, first_page)?;
            if record::is_compressed(slot.flags) {
                record::decompress(&raw)
            } else {
                Ok(raw)
            }
        } else if record::is_compressed(slot.flags) {
            record::decompress(payload)
        } else {
            Ok(payload.to_vec())
        }
    }

    pub fn read_record(&self, loc: RecordLocation) -> Result<Vec<u8>> {
        let page = self.read_page(loc.page_id)?;
        for slot in record::iter_slots(&page) {
            if slot.offset == loc.slot_offset {
                return self.resolve_bytes(&page, &slot);
            }
        }
        Err(Error::CorruptRecord {
            page_id: loc.page_id,
            slot_offset: loc.slot_offset,
            reason: "no slot at that offset",
        })
    }

    pub fn scan_collection(&self, collection: &str) -> Result<Vec<(RecordLocation, Vec<u8>)>> {
        let Some(meta) = self.collection(collection) else {
            return Err(Error::UnknownCollection(collection.to_string()));
        };
        let mut out = Vec::new();
        let mut page_id = meta.first_page_id;
        while page_id != 0 {
            let page = self.read_page(page_id)?;
            for slot in record::iter_slots(&page) {
                if !record::is_deleted(slot.flags) {
                    let bytes = self.resolve_bytes(&page, &slot)?;
                    out.push((
                        RecordLocation {
                            record_id: slot.record_id,
                            page_id,
                            slot_offset: slot.offset,
                        },
                        bytes,
                    ));
                }
            }
            page_id = page.next_page_id();
        }
        Ok(out)
    }

    /// Like `scan_collection`, but reads every page with the cache bypassed,
    /// for statements carrying the `NO_CACHE` hint.
    pub fn scan_collection_uncached(&self, collection: &str) -> Result<Vec<(RecordLocation, Vec<u8>)>> {
        let Some(meta) = self.collection(collection) else {
            return Err(Error::UnknownCollection(collection.to_string()));
        };
        let mut out = Vec::new();
        let mut page_id = meta.first_page_id;
        while page_id != 0 {
            let page = self.read_page_uncached(page_id)?;
            for slot in record::iter_slots(&page) {
                if !record::is_deleted(slot.flags) {
                    let bytes = self.resolve_bytes(&page, &slot)?;
                    out.push((
                        RecordLocation {
                            record_id: slot.record_id,
                            page_id,
                            slot_offset: slot.offset,
                        },
                        bytes,
                    ));
                }
            }
            page_id = page.next_page_id();
        }
        Ok(out)
    }

    /// Rewrites a collection's chain keeping only live records and returns
    /// the number of tombstoned records reclaimed. Old pages, including any
    /// orphaned overflow chains, are retained as dead space; there is no
    /// free-page list in this version (see DESIGN.md).
    pub fn vacuum(&mut self, collection: &str) -> Result<u64> {
        let Some(meta) = self.collection(collection) else {
            return Err(Error::UnknownCollection(collection.to_string()));
        };
        let mut live = Vec::new();
        let mut reclaimed = 0u64;
        let mut page_id = meta.first_page_id;
        while page_id != 0 {
            let page = self.read_page(page_id)?;
            for slot in record::iter_slots(&page) {
                if record::is_deleted(slot.flags) {
                    reclaimed += 1;
                } else {
                    live.push((slot.record_id, self.resolve_bytes(&page, &slot)?));
                }
            }
            page_id = page.next_page_id();
        }

        {
            let c = self.collections.iter_mut().find(|c| c.name == collection).unwrap();
            c.first_page_id = 0;
        }
        self.flush_meta()?;
        for (record_id, bytes) in live {
            self.insert_record_with_id(collection, record_id, &bytes)?;
        }
        Ok(reclaimed)
    }

    // ---- indexes ----------------------------------------------------------

    pub fn indexes(&self) -> &[IndexMeta] {
        &self.indexes
    }

    pub fn find_index(&self, collection: &str, field: &str) -> Option<&IndexMeta> {
        self.indexes.iter().find(|i| i.collection == collection && i.field == field)
    }

    pub fn find_index_by_name(&self, name: &str) -> Option<&IndexMeta> {
        self.indexes.iter().find(|i| i.name.as_deref() == Some(name))
    }

    pub fn create_index(&mut self, name: Option<String>, collection: &str, field: &str, if_not_exists: bool) -> Result<()> {
        if self.find_index(collection, field).is_some() {
            return if if_not_exists {
                Ok(())
            } else {
                Err(Error::DuplicateKey(format!("index already exists on {collection}.{field}")))
            };
        }
        let rows = self.scan_collection(collection)?;
        let mut entries: Vec<(Vec<u8>, RecordLocation)> = Vec::new();
        for (loc, bytes) in rows {
            let doc = Document::decode(&bytes).map_err(|_| Error::CorruptRecord {
                page_id: loc.page_id,
                slot_offset: loc.slot_offset,
                reason: "invalid document encoding",
            })?;
            if let Some(value) = doc.get_path(field) {
                if let Some(key) = encode_sortable_key(value) {
                    entries.push((key, loc));
                }
            }
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.record_id.cmp(&b.1.record_id)));
        let root = BTree::bulk_load(self, &entries)?;
        self.indexes.push(IndexMeta {
            name,
            collection: collection.to_string(),
            field: field.to_string(),
            root_page_id: root,
        });
        self.flush_meta()
    }

    pub fn drop_index_by_name(&mut self, name: &str, if_exists: bool) -> Result<()> {
        let pos = self.indexes.iter().position(|i| i.name.as_deref() == Some(name));
        self.finish_drop_index(pos, if_exists)
    }

    pub fn drop_index_by_field(&mut self, collection: &str, field: &str, if_exists: bool) -> Result<()> {
        let pos = self.indexes.iter().position(|i| i.collection == collection && i.field == field);
        self.finish_drop_index(pos, if_exists)
    }

    fn finish_drop_index(&mut self, pos: Option<usize>, if_exists: bool) -> Result<()> {
        match pos {
            Some(pos) => {
                self.indexes.remove(pos);
                self.flush_meta()
            }
            None if if_exists => Ok(()),
            None => Err(Error::UnknownIndex("no matching index".to_string())),
        }
    }

    pub fn index_lookup(&self, collection: &str, field: &str, key: &[u8]) -> Result<Vec<RecordLocation>> {
        let Some(idx) = self.find_index(collection, field) else {
            return Err(Error::UnknownIndex(format!("{collection}.{field}")));
        };
        BTree::load(idx.root_page_id).lookup(self, key)
    }

    pub fn index_range(&self, collection: &str, field: &str, lo: &[u8], hi: &[u8]) -> Result<Vec<RecordLocation>> {
        let Some(idx) = self.find_index(collection, field) else {
            return Err(Error::UnknownIndex(format!("{collection}.{field}")));
        };
        BTree::load(idx.root_page_id).range(self, lo, hi)
    }

    pub fn index_insert_entry(&mut self, collection: &str, field: &str, key: &[u8], loc: RecordLocation) -> Result<()> {
        let Some(pos) = self.indexes.iter().position(|i| i.collection == collection && i.field == field) else {
            return Ok(());
        };
        let root = self.indexes[pos].root_page_id;
        let mut tree = BTree::load(root);
        let new_root = tree.insert(self, key, loc)?;
        self.indexes[pos].root_page_id = new_root;
        self.flush_meta()
    }

    pub fn index_remove_entry(&mut self, collection: &str, field: &str, key: &[u8], record_id: u64) -> Result<()> {
        let Some(pos) = self.indexes.iter().position(|i| i.collection == collection && i.field == field) else {
            return Ok(());
        };
        let root = self.indexes[pos].root_page_id;
        let mut tree = BTree::load(root);
        tree.remove(self, key, record_id)?;
        self.flush_meta()
    }

    // ---- views --------------------------------------------------------

    pub fn views(&self) -> &[ViewMeta] {
        &self.views
    }

    pub fn view(&self, name: &str) -> Option<&ViewMeta> {
        self.views.iter().find(|v| v.name == name)
    }

    pub fn create_view(&mut self, name: &str, query_text: &str) -> Result<()> {
        self.views.retain(|v| v.name != name);
        self.views.push(ViewMeta {
            name: name.to_string(),
            query_text: query_text.to_string(),
        });
        self.flush_meta()
    }

    pub fn drop_view(&mut self, name: &str, if_exists: bool) -> Result<()> {
        let pos = self.views.iter().position(|v| v.name == name);
        match pos {
            Some(pos) => {
                self.views.remove(pos);
                self.flush_meta()
            }
            None if if_exists => Ok(()),
            None => Err(Error::InvalidArgument(format!("unknown view {name}"))),
        }
    }

    // ---- locking --------------------------------------------------------

    pub fn lock_manager(&self) -> &LockManager {
        &self.locks
    }

    /// An owned handle to the lock manager, so a caller can hold a guard
    /// across a later `&mut Pager` borrow without aliasing `self`.
    pub fn lock_manager_arc(&self) -> Arc<LockManager> {
        Arc::clone(&self.locks)
    }

    pub fn collection_lock_id(&self, collection: &str) -> u32 {
        fnv1a32(collection.as_bytes())
    }

    /// Next id `insert_record` would assign to this collection, absent any
    /// concurrent writer. Lets the query layer stamp a document's `_id`
    /// field before the physical insert happens.
    pub fn peek_next_record_id(&self, collection: &str) -> u64 {
        self.collection(collection).map(|c| c.next_record_id).unwrap_or(1)
    }

    // ---- transactions ---------------------------------------------------

    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(Error::TransactionActive);
        }
        self.tx = Some(Transaction {
            total_pages_snapshot: self.total_pages,
            collections_snapshot: self.collections.clone(),
            indexes_snapshot: self.indexes.clone(),
            views_snapshot: self.views.clone(),
            undo: HashMap::new(),
            new_pages: HashSet::new(),
        });
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        if self.tx.is_none() {
            return Err(Error::NoActiveTransaction);
        }
        self.flush_meta()?;
        self.wal.commit()?;
        self.tx = None;
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<()> {
        let Some(tx) = self.tx.take() else {
            return Err(Error::NoActiveTransaction);
        };
        for (page_id, before) in tx.undo.iter() {
            write_page_raw(&self.file, *page_id, before)?;
        }
        self.total_pages = tx.total_pages_snapshot;
        self.collections = tx.collections_snapshot;
        self.indexes = tx.indexes_snapshot;
        self.views = tx.views_snapshot;
        self.file.sync_data()?;
        self.cache.clear();
        self.wal.truncate()?;
        Ok(())
    }

    /// Outside a transaction, each successful DML/DDL statement ends with a
    /// WAL commit so a later reader never observes an uncommitted write.
    /// Inside a transaction this is a no-op; the statement-level commit is
    /// deferred to the enclosing `commit()`.
    pub fn end_statement(&mut self) -> Result<()> {
        if self.tx.is_none() {
            self.wal.commit()?;
        }
        Ok(())
    }

    /// Flushes meta, marks a checkpoint and truncates the WAL. Safe to call
    /// whenever no transaction is active.
    pub fn checkpoint(&mut self) -> Result<()> {
        self.flush_meta()?;
        self.wal.checkpoint_marker()?;
        self.file.sync_data()?;
        self.wal.truncate()?;
        Ok(())
    }
}

fn slot_data_len_at(page: &Page, slot_offset: u16) -> u16 {
    let off = slot_offset as usize;
    u16::from_le_bytes(page.buf[off + 8..off + 10].try_into().unwrap())
}

fn slot_flags_at(page: &Page, slot_offset: u16) -> u8 {
    page.buf[slot_offset as usize + 10]
}

fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn wal_path_for(db_path: &Path) -> PathBuf {
    let mut os = db_path.as_os_str().to_owned();
    os.push(".wal");
    PathBuf::from(os)
}

// ---- meta page encode/decode ----------------------------------------------

fn write_str(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn write_str32(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
}

fn read_str(buf: &[u8], pos: &mut usize) -> Result<String> {
    let len = u16::from_le_bytes(buf[*pos..*pos + 2].try_into().unwrap()) as usize;
    *pos += 2;
    let s = std::str::from_utf8(&buf[*pos..*pos + len])
        .map_err(|_| Error::CorruptMeta("invalid utf8 in meta string"))?
        .to_string();
    *pos += len;
    Ok(s)
}

fn read_str32(buf: &[u8], pos: &mut usize) -> Result<String> {
    let len = u32::from_le_bytes(buf[*pos..*pos + 4].try_into().unwrap()) as usize;
    *pos += 4;
    let s = std::str::from_utf8(&buf[*pos..*pos + len])
        .map_err(|_| Error::CorruptMeta("invalid utf8 in meta string"))?
        .to_string();
    *pos += len;
    Ok(s)
}

fn encode_meta(
    page: &mut Page,
    total_pages: u32,
    collections: &[CollectionMeta],
    indexes: &[IndexMeta],
    views: &[ViewMeta],
) -> Result<()> {
    let mut buf = Vec::with_capacity(PAGE_SIZE - PAGE_HEADER_SIZE);
    buf.extend_from_slice(&total_pages.to_le_bytes());
    buf.extend_from_slice(&(collections.len() as u16).to_le_bytes());
    for c in collections {
        write_str(&mut buf, &c.name);
        buf.extend_from_slice(&c.first_page_id.to_le_bytes());
        buf.extend_from_slice(&c.next_record_id.to_le_bytes());
    }
    buf.extend_from_slice(&(indexes.len() as u16).to_le_bytes());
    for i in indexes {
        write_str(&mut buf, &i.collection);
        write_str(&mut buf, &i.field);
        buf.extend_from_slice(&i.root_page_id.to_le_bytes());
        match &i.name {
            Some(n) => {
                buf.push(1);
                write_str(&mut buf, n);
            }
            None => buf.push(0),
        }
    }
    buf.extend_from_slice(&(views.len() as u16).to_le_bytes());
    for v in views {
        write_str(&mut buf, &v.name);
        write_str32(&mut buf, &v.query_text);
    }
    if buf.len() > PAGE_SIZE - PAGE_HEADER_SIZE {
        return Err(Error::CorruptMeta("metadata exceeds one page"));
    }
    page.body_mut()[..buf.len()].copy_from_slice(&buf);
    Ok(())
}

#[allow(clippy::type_complexity)]
fn decode_meta(bytes: &[u8; PAGE_SIZE]) -> Result<(u32, Vec<CollectionMeta>, Vec<IndexMeta>, Vec<ViewMeta>)> {
    let body = &bytes[PAGE_HEADER_SIZE..];
    let mut pos = 0usize;
    let total_pages = u32::from_le_bytes(body[pos..pos + 4].try_into().unwrap());
    pos += 4;

    let num_collections = u16::from_le_bytes(body[pos..pos + 2].try_into().unwrap());
    pos += 2;
    let mut collections = Vec::with_capacity(num_collections as usize);
    for _ in 0..num_collections {
        let name = read_str(body, &mut pos)?;
        let first_page_id = u32::from_le_bytes(body[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let next_record_id = u64::from_le_bytes(body[pos..pos + 8].try_into().unwrap());
        pos += 8;
        collections.push(CollectionMeta {
            name,
            first_page_id,
            next_record_id,
        });
    }

    let num_indexes = u16::from_le_bytes(body[pos..pos + 2].try_into().unwrap());
    pos += 2;
    let mut indexes = Vec::with_capacity(num_indexes as usize);
    for _ in 0..num_indexes {
        let collection = read_str(body, &mut pos)?;
        let field = read_str(body, &mut pos)?;
        let root_page_id = u32::from_le_bytes(body[pos..pos + 4].try_into().unwrap());
        pos += 4;
        let has_name = body[pos];
        pos += 1;
        let name = if has_name == 1 { Some(read_str(body, &mut pos)?) } else { None };
        indexes.push(IndexMeta {
            name,
            collection,
            field,
            root_page_id,
        });
    }

    let num_views = u16::from_le_bytes(body[pos..pos + 2].try_into().unwrap());
    pos += 2;
    let mut views = Vec::with_capacity(num_views as usize);
    for _ in 0..num_views {
        let name = read_str(body, &mut pos)?;
        let query_text = read_str32(body, &mut pos)?;
        views.push(ViewMeta { name, query_text });
    }

    Ok((total_pages, collections, indexes, views))
}

// ---- raw positioned I/O ----------------------------------------------------

fn read_page_raw(file: &File, page_id: u32) -> Result<[u8; PAGE_SIZE]> {
    let offset = page_id as u64 * PAGE_SIZE as u64;
    let mut buf = [0u8; PAGE_SIZE];
    read_exact_at(file, offset, &mut buf)?;
    Ok(buf)
}

fn write_page_raw(file: &File, page_id: u32, bytes: &[u8; PAGE_SIZE]) -> Result<()> {
    let offset = page_id as u64 * PAGE_SIZE as u64;
    let required = offset + PAGE_SIZE as u64;
    if file.metadata()?.len() < required {
        file.set_len(required)?;
    }
    write_all_at(file, offset, bytes)
}

fn read_exact_at(file: &File, mut offset: u64, mut buf: &mut [u8]) -> Result<()> {
    while !buf.is_empty() {
        let n = read_at(file, offset, buf)?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "read_at returned 0 bytes")));
        }
        offset += n as u64;
        buf = &mut buf[n..];
    }
    Ok(())
}

fn write_all_at(file: &File, mut offset: u64, mut buf: &[u8]) -> Result<()> {
    while !buf.is_empty() {
        let n = write_at(file, offset, buf)?;
        if n == 0 {
            return Err(Error::Io(io::Error::new(io::ErrorKind::WriteZero, "write_at returned 0 bytes")));
        }
        offset += n as u64;
        buf = &buf[n..];
    }
    Ok(())
}

#[cfg(unix)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.read_at(buf, offset)
}
#[cfg(windows)]
fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
    file.seek_read(buf, offset)
}
#[cfg(unix)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    file.write_at(buf, offset)
}
#[cfg(windows)]
fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<usize> {
    file.seek_write(buf, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::FieldValue;
    use tempfile::tempdir;

    fn doc(name: &str, qty: i64) -> Vec<u8> {
        let mut d = Document::new();
        d.push("name", FieldValue::String(name.to_string()));
        d.push("qty", FieldValue::Int64(qty));
        d.encode()
    }

    #[test]
    fn insert_and_scan_roundtrip() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("t.ndb"), DbOptions::default()).unwrap();
        pager.insert_record("items", &doc("widget", 10)).unwrap();
        pager.insert_record("items", &doc("gadget", 5)).unwrap();
        let rows = pager.scan_collection("items").unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn update_tombstones_when_length_changes() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("t.ndb"), DbOptions::default()).unwrap();
        let loc = pager.insert_record("items", &doc("widget", 10)).unwrap();
        let new_loc = pager.update_record("items", loc, &doc("widget-longer-name", 999)).unwrap();
        assert_eq!(new_loc.record_id, loc.record_id);
        let rows = pager.scan_collection("items").unwrap();
        assert_eq!(rows.len(), 1);
        let decoded = Document::decode(&rows[0].1).unwrap();
        assert_eq!(decoded.get("qty"), Some(&FieldValue::Int64(999)));
    }

    #[test]
    fn delete_then_vacuum_reclaims() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("t.ndb"), DbOptions::default()).unwrap();
        let loc = pager.insert_record("items", &doc("widget", 10)).unwrap();
        pager.insert_record("items", &doc("gadget", 5)).unwrap();
        pager.mark_deleted(loc).unwrap();
        assert_eq!(pager.scan_collection("items").unwrap().len(), 1);
        let reclaimed = pager.vacuum("items").unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(pager.scan_collection("items").unwrap().len(), 1);
    }

    #[test]
    fn overflow_record_roundtrips() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("t.ndb"), DbOptions::default()).unwrap();
        let mut d = Document::new();
        d.push("blob", FieldValue::String("x".repeat(9000)));
        let bytes = d.encode();
        let loc = pager.insert_record("big", &bytes).unwrap();
        let got = pager.read_record(loc).unwrap();
        assert_eq!(got, bytes);
    }

    #[test]
    fn reopen_recovers_committed_inserts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.ndb");
        {
            let mut pager = Pager::open(&path, DbOptions::default()).unwrap();
            pager.insert_record("users", &doc("Alice", 0)).unwrap();
            pager.insert_record("users", &doc("Bob", 0)).unwrap();
            pager.end_statement().unwrap();
        }
        let pager2 = Pager::open(&path, DbOptions::default()).unwrap();
        let rows = pager2.scan_collection("users").unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn transaction_rollback_undoes_writes() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("t.ndb"), DbOptions::default()).unwrap();
        let loc = pager.insert_record("items", &doc("widget", 10)).unwrap();
        pager.end_statement().unwrap();

        pager.begin().unwrap();
        pager.update_record("items", loc, &doc("widget", 999)).unwrap();
        pager.insert_record("items", &doc("gadget", 5)).unwrap();
        pager.rollback().unwrap();

        let rows = pager.scan_collection("items").unwrap();
        assert_eq!(rows.len(), 1);
        let decoded = Document::decode(&rows[0].1).unwrap();
        assert_eq!(decoded.get("qty"), Some(&FieldValue::Int64(10)));
    }

    #[test]
    fn second_begin_while_active_fails() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("t.ndb"), DbOptions::default()).unwrap();
        pager.begin().unwrap();
        let err = pager.begin().unwrap_err();
        assert!(matches!(err, Error::TransactionActive));
    }

    #[test]
    fn create_index_then_lookup() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("t.ndb"), DbOptions::default()).unwrap();
        pager.insert_record("items", &doc("widget", 10)).unwrap();
        pager.insert_record("items", &doc("gadget", 5)).unwrap();
        pager.create_index(Some("idx_qty".into()), "items", "qty", false).unwrap();
        let key = encode_sortable_key(&FieldValue::Int64(5)).unwrap();
        let hits = pager.index_lookup("items", "qty", &key).unwrap();
        assert_eq!(hits.len(), 1);
    }
}
