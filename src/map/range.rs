//! Ordered key-range enumeration.
//!
//! A bounded depth-first walk of the trie snapshot: boundary children
//! carry the remaining bound down, interior children enumerate their
//! whole subtree. Children are stored ascending by byte index and a
//! node's attached key is a proper prefix of everything below it, so
//! results come out in lexicographic order without sorting.

use std::sync::atomic::Ordering;

use super::map::CinderMap;
use super::KeyValuePair;
use crate::buffer::MapGuard;
use crate::errinput;
use crate::error::Result;
use crate::meta::META_ROOT_AT;
use crate::node::{codec, INode};

impl CinderMap {
    /// Enumerate live pairs whose keys lie in the half-open interval
    /// `[start, end)`, ascending, restricted to versions at or above
    /// `min_version` when one is given.
    pub fn range(
        &self,
        start: &[u8],
        end: &[u8],
        min_version: Option<u64>,
    ) -> Result<Vec<KeyValuePair>> {
        self.ensure_open()?;
        if start > end {
            return errinput!("start key is larger than end key");
        }

        // The reader share is held for the whole scan; the root read
        // below is the single snapshot point and every node it reaches
        // is immutable.
        let map = self.buffer.map();
        let root_offset = map.atomic_u64(META_ROOT_AT).load(Ordering::Acquire);
        let root = codec::read_inode(&map, root_offset)?;

        let mut out = Vec::new();
        scan(
            &map,
            &root,
            0,
            Some(start),
            Some(end),
            min_version.unwrap_or(0),
            &mut out,
        )?;
        Ok(out)
    }
}

/// Walk one node of the snapshot. `lower`/`upper` are the full boundary
/// keys, active only along the boundary chains; `None` means the whole
/// subtree is inside the interval on that side. A node at `level` was
/// reached by consuming `level` key bytes, so an active bound always has
/// at least `level` bytes.
fn scan(
    map: &MapGuard,
    node: &INode,
    level: usize,
    lower: Option<&[u8]>,
    upper: Option<&[u8]>,
    min_version: u64,
    out: &mut Vec<KeyValuePair>,
) -> Result<()> {
    // This node's prefix equals the exclusive upper bound: its attached
    // key and everything below it sort at or above the bound.
    if let Some(upper_key) = upper {
        if upper_key.len() == level {
            return Ok(());
        }
    }

    // While lower-bound bytes remain, the node's prefix sorts below the
    // bound and must not be emitted.
    let lower_pending = lower.is_some_and(|lower_key| lower_key.len() > level);

    if level > 0 && !lower_pending {
        if let Some(leaf) = &node.leaf {
            if !leaf.is_vacant() && leaf.version >= min_version {
                out.push(KeyValuePair {
                    version: leaf.version,
                    key: leaf.key.clone(),
                    value: leaf.value.clone(),
                });
            }
        }
    }

    let low_index = match lower {
        Some(lower_key) if lower_pending => lower_key[level],
        _ => 0,
    };
    let high_index = match upper {
        Some(upper_key) => upper_key[level],
        None => u8::MAX,
    };

    for index in low_index..=high_index {
        if !node.bitmap.is_set(index) {
            continue;
        }
        let pos = node.bitmap.position(index);
        let child = codec::read_inode(map, node.child_offset(pos))?;

        let child_lower = match lower {
            Some(lower_key) if lower_pending && lower_key[level] == index => lower,
            _ => None,
        };
        let child_upper = match upper {
            Some(upper_key) if upper_key[level] == index => upper,
            _ => None,
        };

        scan(map, &child, level + 1, child_lower, child_upper, min_version, out)?;
    }

    Ok(())
}
