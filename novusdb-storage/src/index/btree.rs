//! Disk-resident B+tree: sortable byte-string keys mapping to one or more
//! `RecordLocation`s. Duplicate keys are disambiguated by the record id
//! embedded in each location, so every (key, record_id) pair is unique and
//! totally ordered even when many records share a key.
//!
//! Page layout, after the shared 16-byte page header:
//! `is_leaf:u8, num_cells:u16, sibling:u32` followed by cells.
//! Leaf cells: `key_len:u16, key_bytes, RecordLocation (14 bytes)`.
//! Internal cells: `key_len:u16, key_bytes, record_id:u64, child_page_id:u32`,
//! read left to right as "composite key < (key_bytes, record_id) routes to
//! `child_page_id`"; anything past the last cell routes to `sibling`
//! (the node's rightmost child).

use std::cmp::Ordering;

use crate::error::Result;
use crate::page::{Page, PAGE_HEADER_SIZE, PAGE_SIZE, PAGE_TYPE_INDEX};
use crate::pager::Pager;
use crate::record::RecordLocation;

const NODE_HEADER_LEN: usize = 1 + 2 + 4;
const BODY_AVAILABLE: usize = PAGE_SIZE - PAGE_HEADER_SIZE - NODE_HEADER_LEN;
const RECORD_LOCATION_LEN: usize = 14;

/// A loaded secondary index, identified by the page id of its current root.
/// Root may change across inserts that split the root; callers must persist
/// the returned root id back into `IndexMeta`.
pub struct BTree {
    root: u32,
}

enum InsertOutcome {
    Done,
    Split {
        sep_key: Vec<u8>,
        sep_record_id: u64,
        new_page: u32,
    },
}

impl BTree {
    pub fn load(root: u32) -> Self {
        Self { root }
    }

    pub fn root(&self) -> u32 {
        self.root
    }

    /// Builds a balanced tree bottom-up from pre-sorted `(key, location)`
    /// pairs (sorted by `(key, location.record_id)`) and returns the root
    /// page id. Used by `CREATE INDEX` to avoid one split-driven insert per
    /// existing row.
    pub fn bulk_load(pager: &mut Pager, entries: &[(Vec<u8>, RecordLocation)]) -> Result<u32> {
        if entries.is_empty() {
            let id = pager.allocate_page(PAGE_TYPE_INDEX)?;
            let mut page = pager.read_page(id)?;
            write_leaf(&mut page, &[], 0);
            pager.write_page(&page)?;
            return Ok(id);
        }

        let mut level = pack_leaves(pager, entries)?;
        while level.len() > 1 {
            level = pack_internal(pager, level)?;
        }
        Ok(level[0].2)
    }

    pub fn insert(&mut self, pager: &mut Pager, key: &[u8], loc: RecordLocation) -> Result<u32> {
        match insert_rec(pager, self.root, key, loc)? {
            InsertOutcome::Done => Ok(self.root),
            InsertOutcome::Split {
                sep_key,
                sep_record_id,
                new_page,
            } => {
                let new_root = pager.allocate_page(PAGE_TYPE_INDEX)?;
                let mut page = pager.read_page(new_root)?;
                write_internal(&mut page, &[(sep_key, sep_record_id, self.root)], new_page);
                pager.write_page(&page)?;
                self.root = new_root;
                Ok(new_root)
            }
        }
    }

    pub fn lookup(&self, pager: &Pager, key: &[u8]) -> Result<Vec<RecordLocation>> {
        let mut leaf_id = find_leaf(pager, self.root, key, 0)?;
        let mut out = Vec::new();
        loop {
            let page = pager.read_page(leaf_id)?;
            let cells = read_leaf_cells(&page);
            let mut keep_going = false;
            let mut stop = false;
            for (k, loc) in &cells {
                match k.as_slice().cmp(key) {
                    Ordering::Equal => {
                        out.push(*loc);
                        keep_going = true;
                    }
                    Ordering::Greater => {
                        stop = true;
                        break;
                    }
                    Ordering::Less => {}
                }
            }
            let next = sibling(&page);
            if stop || !keep_going || next == 0 {
                break;
            }
            leaf_id = next;
        }
        Ok(out)
    }

    pub fn range(&self, pager: &Pager, lo: &[u8], hi: &[u8]) -> Result<Vec<RecordLocation>> {
        let mut leaf_id = find_leaf(pager, self.root, lo, 0)?;
        let mut out = Vec::new();
        loop {
            let page = pager.read_page(leaf_id)?;
            let cells = read_leaf_cells(&page);
            let mut stop = false;
            for (k, loc) in &cells {
                if k.as_slice() < lo {
                    continue;
                }
                if k.as_slice() > hi {
                    stop = true;
                    break;
                }
                out.push(*loc);
            }
            let next = sibling(&page);
            if stop || next == 0 {
                break;
            }
            leaf_id = next;
        }
        Ok(out)
    }

    /// Removes the entry for an exact `(key, record_id)` pair. A no-op if no
    /// such entry exists (index maintenance calls this speculatively after
    /// tombstoning a record). Performs no rebalancing on underflow — dead
    /// cells below the split threshold are accepted (see DESIGN.md).
    pub fn remove(&mut self, pager: &mut Pager, key: &[u8], record_id: u64) -> Result<()> {
        let leaf_id = find_leaf(pager, self.root, key, record_id)?;
        let mut page = pager.read_page(leaf_id)?;
        let mut cells = read_leaf_cells(&page);
        if let Some(pos) = cells
            .iter()
            .position(|(k, loc)| k.as_slice() == key && loc.record_id == record_id)
        {
            cells.remove(pos);
            let next = sibling(&page);
            write_leaf(&mut page, &cells, next);
            pager.write_page(&page)?;
        }
        Ok(())
    }
}

fn composite_cmp(key_a: &[u8], rid_a: u64, key_b: &[u8], rid_b: u64) -> Ordering {
    key_a.cmp(key_b).then(rid_a.cmp(&rid_b))
}

fn is_leaf(page: &Page) -> bool {
    page.body()[0] == 1
}

fn num_cells(page: &Page) -> u16 {
    u16::from_le_bytes(page.body()[1..3].try_into().unwrap())
}

fn sibling(page: &Page) -> u32 {
    u32::from_le_bytes(page.body()[3..7].try_into().unwrap())
}

fn find_leaf(pager: &Pager, page_id: u32, key: &[u8], record_id: u64) -> Result<u32> {
    let page = pager.read_page(page_id)?;
    if is_leaf(&page) {
        return Ok(page_id);
    }
    let child = route_internal(&page, key, record_id);
    find_leaf(pager, child, key, record_id)
}

fn route_internal(page: &Page, key: &[u8], record_id: u64) -> u32 {
    for (sep_key, sep_rid, child) in read_internal_cells(page) {
        if composite_cmp(key, record_id, &sep_key, sep_rid) == Ordering::Less {
            return child;
        }
    }
    sibling(page)
}

fn read_leaf_cells(page: &Page) -> Vec<(Vec<u8>, RecordLocation)> {
    let body = page.body();
    let mut pos = NODE_HEADER_LEN;
    let mut out = Vec::with_capacity(num_cells(page) as usize);
    for _ in 0..num_cells(page) {
        let key_len = u16::from_le_bytes(body[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        let key = body[pos..pos + key_len].to_vec();
        pos += key_len;
        let loc = RecordLocation::decode(&body[pos..pos + RECORD_LOCATION_LEN]);
        pos += RECORD_LOCATION_LEN;
        out.push((key, loc));
    }
    out
}

fn read_internal_cells(page: &Page) -> Vec<(Vec<u8>, u64, u32)> {
    let body = page.body();
    let mut pos = NODE_HEADER_LEN;
    let mut out = Vec::with_capacity(num_cells(page) as usize);
    for _ in 0..num_cells(page) {
        let key_len = u16::from_le_bytes(body[pos..pos + 2].try_into().unwrap()) as usize;
        pos += 2;
        let key = body[pos..pos + key_len].to_vec();
        pos += key_len;
        let record_id = u64::from_le_bytes(body[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let child = u32::from_le_bytes(body[pos..pos + 4].try_into().unwrap());
        pos += 4;
        out.push((key, record_id, child));
    }
    out
}

fn leaf_cell_len(key_len: usize) -> usize {
    2 + key_len + RECORD_LOCATION_LEN
}

fn internal_cell_len(key_len: usize) -> usize {
    2 + key_len + 8 + 4
}

fn write_leaf(page: &mut Page, cells: &[(Vec<u8>, RecordLocation)], next_leaf: u32) {
    let body = page.body_mut();
    body[0] = 1;
    body[1..3].copy_from_slice(&(cells.len() as u16).to_le_bytes());
    body[3..7].copy_from_slice(&next_leaf.to_le_bytes());
    let mut pos = NODE_HEADER_LEN;
    for (key, loc) in cells {
        body[pos..pos + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
        pos += 2;
        body[pos..pos + key.len()].copy_from_slice(key);
        pos += key.len();
        let encoded = loc.encode();
        body[pos..pos + RECORD_LOCATION_LEN].copy_from_slice(&encoded);
        pos += RECORD_LOCATION_LEN;
    }
}

fn write_internal(page: &mut Page, cells: &[(Vec<u8>, u64, u32)], rightmost: u32) {
    let body = page.body_mut();
    body[0] = 0;
    body[1..3].copy_from_slice(&(cells.len() as u16).to_le_bytes());
    body[3..7].copy_from_slice(&rightmost.to_le_bytes());
    let mut pos = NODE_HEADER_LEN;
    for (key, record_id, child) in cells {
        body[pos..pos + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
        pos += 2;
        body[pos..pos + key.len()].copy_from_slice(key);
        pos += key.len();
        body[pos..pos + 8].copy_from_slice(&record_id.to_le_bytes());
        pos += 8;
        body[pos..pos + 4].copy_from_slice(&child.to_le_bytes());
        pos += 4;
    }
}

fn leaf_fits(cells: &[(Vec<u8>, RecordLocation)]) -> bool {
    cells.iter().map(|(k, _)| leaf_cell_len(k.len())).sum::<usize>() <= BODY_AVAILABLE
}

fn internal_fits(cells: &[(Vec<u8>, u64, u32)]) -> bool {
    cells.iter().map(|(k, _, _)| internal_cell_len(k.len())).sum::<usize>() <= BODY_AVAILABLE
}

fn insert_rec(pager: &mut Pager, page_id: u32, key: &[u8], loc: RecordLocation) -> Result<InsertOutcome> {
    let mut page = pager.read_page(page_id)?;
    if is_leaf(&page) {
        let mut cells = read_leaf_cells(&page);
        let pos = cells
            .iter()
            .position(|(k, l)| composite_cmp(key, loc.record_id, k, l.record_id) == Ordering::Less)
            .unwrap_or(cells.len());
        cells.insert(pos, (key.to_vec(), loc));

        if leaf_fits(&cells) {
            let next = sibling(&page);
            write_leaf(&mut page, &cells, next);
            pager.write_page(&page)?;
            Ok(InsertOutcome::Done)
        } else {
            let next = sibling(&page);
            let mid = cells.len() / 2;
            let right_cells = cells.split_off(mid);
            let right_id = pager.allocate_page(PAGE_TYPE_INDEX)?;

            write_leaf(&mut page, &cells, right_id);
            pager.write_page(&page)?;

            let mut right_page = pager.read_page(right_id)?;
            write_leaf(&mut right_page, &right_cells, next);
            pager.write_page(&right_page)?;

            let (sep_key, sep_loc) = right_cells[0].clone();
            Ok(InsertOutcome::Split {
                sep_key,
                sep_record_id: sep_loc.record_id,
                new_page: right_id,
            })
        }
    } else {
        let child_id = route_internal(&page, key, loc.record_id);
        match insert_rec(pager, child_id, key, loc)? {
            InsertOutcome::Done => Ok(InsertOutcome::Done),
            InsertOutcome::Split {
                sep_key,
                sep_record_id,
                new_page,
            } => {
                let mut cells = read_internal_cells(&page);
                let mut rightmost = sibling(&page);
                if let Some(j) = cells.iter().position(|c| c.2 == child_id) {
                    cells[j].2 = new_page;
                    cells.insert(j, (sep_key, sep_record_id, child_id));
                } else {
                    debug_assert_eq!(rightmost, child_id);
                    cells.push((sep_key, sep_record_id, child_id));
                    rightmost = new_page;
                }

                if internal_fits(&cells) {
                    write_internal(&mut page, &cells, rightmost);
                    pager.write_page(&page)?;
                    Ok(InsertOutcome::Done)
                } else {
                    let mid = cells.len() / 2;
                    let promote = cells[mid].clone();
                    let left_rightmost = promote.2;
                    let left_cells = cells[..mid].to_vec();
                    let right_cells = cells[mid + 1..].to_vec();
                    let right_id = pager.allocate_page(PAGE_TYPE_INDEX)?;

                    write_internal(&mut page, &left_cells, left_rightmost);
                    pager.write_page(&page)?;

                    let mut right_page = pager.read_page(right_id)?;
                    write_internal(&mut right_page, &right_cells, rightmost);
                    pager.write_page(&right_page)?;

                    Ok(InsertOutcome::Split {
                        sep_key: promote.0,
                        sep_record_id: promote.1,
                        new_page: right_id,
                    })
                }
            }
        }
    }
}

/// Greedily groups pre-sorted entries into leaf pages, linking each to the
/// next via `sibling`, and returns each leaf's `(first_key, first_record_id,
/// page_id)` for the parent level to route on.
fn pack_leaves(pager: &mut Pager, entries: &[(Vec<u8>, RecordLocation)]) -> Result<Vec<(Vec<u8>, u64, u32)>> {
    let mut groups: Vec<Vec<(Vec<u8>, RecordLocation)>> = Vec::new();
    let mut current: Vec<(Vec<u8>, RecordLocation)> = Vec::new();
    let mut used = 0usize;
    for (key, loc) in entries {
        let cell_len = leaf_cell_len(key.len());
        if !current.is_empty() && used + cell_len > BODY_AVAILABLE {
            groups.push(std::mem::take(&mut current));
            used = 0;
        }
        used += cell_len;
        current.push((key.clone(), *loc));
    }
    if !current.is_empty() {
        groups.push(current);
    }

    let page_ids = groups
        .iter()
        .map(|_| pager.allocate_page(PAGE_TYPE_INDEX))
        .collect::<Result<Vec<_>>>()?;

    let mut out = Vec::with_capacity(groups.len());
    for (i, group) in groups.into_iter().enumerate() {
        let id = page_ids[i];
        let next_leaf = page_ids.get(i + 1).copied().unwrap_or(0);
        let mut page = pager.read_page(id)?;
        write_leaf(&mut page, &group, next_leaf);
        pager.write_page(&page)?;
        let (first_key, first_loc) = group[0].clone();
        out.push((first_key, first_loc.record_id, id));
    }
    Ok(out)
}

/// Greedily groups a child level's `(first_key, first_record_id, page_id)`
/// entries into internal-node pages one level up.
fn pack_internal(pager: &mut Pager, children: Vec<(Vec<u8>, u64, u32)>) -> Result<Vec<(Vec<u8>, u64, u32)>> {
    let mut groups: Vec<Vec<(Vec<u8>, u64, u32)>> = Vec::new();
    let mut current: Vec<(Vec<u8>, u64, u32)> = Vec::new();
    let mut used = 0usize;
    for child in children {
        let cell_len = internal_cell_len(child.0.len());
        if !current.is_empty() && used + cell_len > BODY_AVAILABLE {
            groups.push(std::mem::take(&mut current));
            used = 0;
        }
        used += cell_len;
        current.push(child);
    }
    if !current.is_empty() {
        groups.push(current);
    }

    let mut out = Vec::with_capacity(groups.len());
    for group in groups {
        let id = pager.allocate_page(PAGE_TYPE_INDEX)?;
        let mut page = pager.read_page(id)?;
        let rightmost = group.last().unwrap().2;
        let mut cells = Vec::with_capacity(group.len().saturating_sub(1));
        for i in 0..group.len().saturating_sub(1) {
            let (sep_key, sep_rid, _) = group[i + 1].clone();
            cells.push((sep_key, sep_rid, group[i].2));
        }
        write_internal(&mut page, &cells, rightmost);
        pager.write_page(&page)?;
        let (first_key, first_rid, _) = group[0].clone();
        out.push((first_key, first_rid, id));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    use crate::pager::DbOptions;

    fn loc(record_id: u64, page_id: u32) -> RecordLocation {
        RecordLocation {
            record_id,
            page_id,
            slot_offset: 0,
        }
    }

    #[test]
    fn bulk_load_then_lookup() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("idx.ndb"), DbOptions::default()).unwrap();
        let mut entries: Vec<(Vec<u8>, RecordLocation)> = (0..50u64)
            .map(|i| (format!("k{:04}", i).into_bytes(), loc(i, 1)))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.record_id.cmp(&b.1.record_id)));
        let root = BTree::bulk_load(&mut pager, &entries).unwrap();
        let tree = BTree::load(root);
        let hits = tree.lookup(&pager, b"k0025").unwrap();
        assert_eq!(hits, vec![loc(25, 1)]);
    }

    #[test]
    fn insert_splits_and_remains_lookupable() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("idx.ndb"), DbOptions::default()).unwrap();
        let root = BTree::bulk_load(&mut pager, &[]).unwrap();
        let mut tree = BTree::load(root);
        for i in 0..500u64 {
            let key = format!("key-{:06}", i).into_bytes();
            let new_root = tree.insert(&mut pager, &key, loc(i, 2)).unwrap();
            tree = BTree::load(new_root);
        }
        for i in [0u64, 1, 250, 499] {
            let key = format!("key-{:06}", i).into_bytes();
            let hits = tree.lookup(&pager, &key).unwrap();
            assert_eq!(hits, vec![loc(i, 2)], "missing key {i}");
        }
    }

    #[test]
    fn duplicate_keys_distinguished_by_record_id() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("idx.ndb"), DbOptions::default()).unwrap();
        let root = BTree::bulk_load(&mut pager, &[]).unwrap();
        let mut tree = BTree::load(root);
        let r1 = tree.insert(&mut pager, b"dup", loc(1, 3)).unwrap();
        tree = BTree::load(r1);
        let r2 = tree.insert(&mut pager, b"dup", loc(2, 3)).unwrap();
        tree = BTree::load(r2);
        let hits = tree.lookup(&pager, b"dup").unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn range_scan_is_ordered_and_bounded() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("idx.ndb"), DbOptions::default()).unwrap();
        let entries: Vec<(Vec<u8>, RecordLocation)> = (0..30u64)
            .map(|i| (format!("n{:03}", i).into_bytes(), loc(i, 4)))
            .collect();
        let root = BTree::bulk_load(&mut pager, &entries).unwrap();
        let tree = BTree::load(root);
        let hits = tree.range(&pager, b"n010", b"n015").unwrap();
        assert_eq!(hits.len(), 6);
    }

    #[test]
    fn remove_then_lookup_returns_nothing() {
        let dir = tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("idx.ndb"), DbOptions::default()).unwrap();
        let root = BTree::bulk_load(&mut pager, &[]).unwrap();
        let mut tree = BTree::load(root);
        let r1 = tree.insert(&mut pager, b"gone", loc(7, 5)).unwrap();
        tree = BTree::load(r1);
        tree.remove(&mut pager, b"gone", 7).unwrap();
        assert!(tree.lookup(&pager, b"gone").unwrap().is_empty());
    }
}
