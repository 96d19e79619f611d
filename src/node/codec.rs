//! On-disk node format.
//!
//! All integers are fixed-width little-endian. Internal node layout:
//!
//! | offset | size | field |
//! |-------:|-----:|-------|
//! | 0      | 8    | version |
//! | 8      | 8    | start_offset |
//! | 16     | 8    | end_offset (inclusive) |
//! | 24     | 32   | bitmap (8 x u32) |
//! | 56     | 8    | leaf_offset (0 = absent) |
//! | 64     | 8*n  | child offsets, n = popcount(bitmap) |
//!
//! Leaf node layout:
//!
//! | offset | size | field |
//! |-------:|-----:|-------|
//! | 0      | 8    | version |
//! | 8      | 8    | start_offset |
//! | 16     | 8    | end_offset (inclusive) |
//! | 24     | 2    | key_length |
//! | 26     | ...  | key, then value up to end_offset |
//!
//! Decoding bounds a node by the end_offset stored in its own header and
//! cross-checks it against the bitmap's population count, so a damaged
//! bitmap or a misdirected offset surfaces as `Corrupt` instead of being
//! read as garbage.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::{Bitmap, ChildRef, INode, LNode, CHILD_PTR_SIZE, INODE_HEADER_SIZE, LNODE_HEADER_SIZE};
use crate::buffer::MapGuard;
use crate::errcorrupt;
use crate::error::Result;

/// Decode the internal node at `offset`, materializing its attached leaf
/// when one is present.
pub fn read_inode(map: &MapGuard, offset: u64) -> Result<INode> {
    let header = map.slice(offset, offset + INODE_HEADER_SIZE)?;
    let mut cursor = Cursor::new(header);

    let version = cursor.read_u64::<LittleEndian>()?;
    let start_offset = cursor.read_u64::<LittleEndian>()?;
    let end_offset = cursor.read_u64::<LittleEndian>()?;
    let mut words = [0u32; Bitmap::WORDS];
    for word in &mut words {
        *word = cursor.read_u32::<LittleEndian>()?;
    }
    let leaf_offset = cursor.read_u64::<LittleEndian>()?;

    if start_offset != offset {
        return errcorrupt!(
            "internal node at {} records start offset {}",
            offset,
            start_offset
        );
    }
    if end_offset < offset + INODE_HEADER_SIZE - 1 || end_offset >= map.len() {
        return errcorrupt!("internal node at {} has impossible end offset {}", offset, end_offset);
    }

    let bitmap = Bitmap::from_words(words);
    let child_count = bitmap.count();
    let extent = end_offset - offset + 1;
    if extent != INODE_HEADER_SIZE + CHILD_PTR_SIZE * child_count as u64 {
        return errcorrupt!(
            "internal node at {} spans {} bytes but bitmap holds {} children",
            offset,
            extent,
            child_count
        );
    }

    let table = map.slice(offset + INODE_HEADER_SIZE, end_offset + 1)?;
    let mut cursor = Cursor::new(table);
    let mut children = Vec::with_capacity(child_count);
    for _ in 0..child_count {
        children.push(ChildRef::Disk(cursor.read_u64::<LittleEndian>()?));
    }

    let leaf = match leaf_offset {
        0 => None,
        at => Some(read_lnode(map, at)?),
    };

    Ok(INode {
        version,
        start_offset,
        end_offset,
        bitmap,
        leaf,
        children,
    })
}

/// Decode the leaf node at `offset`.
pub fn read_lnode(map: &MapGuard, offset: u64) -> Result<LNode> {
    let header = map.slice(offset, offset + LNODE_HEADER_SIZE)?;
    let mut cursor = Cursor::new(header);

    let version = cursor.read_u64::<LittleEndian>()?;
    let start_offset = cursor.read_u64::<LittleEndian>()?;
    let end_offset = cursor.read_u64::<LittleEndian>()?;
    let key_length = cursor.read_u16::<LittleEndian>()? as u64;

    if start_offset != offset {
        return errcorrupt!("leaf node at {} records start offset {}", offset, start_offset);
    }
    if end_offset < offset + LNODE_HEADER_SIZE - 1 || end_offset >= map.len() {
        return errcorrupt!("leaf node at {} has impossible end offset {}", offset, end_offset);
    }

    let extent = end_offset - offset + 1;
    if LNODE_HEADER_SIZE + key_length > extent {
        return errcorrupt!(
            "leaf node at {} has key length {} beyond its {} byte extent",
            offset,
            key_length,
            extent
        );
    }

    let body = map.slice(offset + LNODE_HEADER_SIZE, end_offset + 1)?;
    let (key, value) = body.split_at(key_length as usize);

    Ok(LNode {
        version,
        start_offset,
        end_offset,
        key: key.to_vec(),
        value: value.to_vec(),
    })
}

/// Serialize a path copy, assigning offsets depth-first starting at `at`.
///
/// Nodes carrying the path's version are emitted as fresh bytes; a fresh
/// attached leaf lands directly after its internal node, fresh child
/// subtrees after that. Unchanged children and leaves are emitted as their
/// pre-existing offsets only. On return every node in the path knows its
/// final `start_offset`, with the root at `at`.
pub fn serialize_path(root: &mut INode, at: u64) -> Vec<u8> {
    serialize_inode(root, at)
}

fn serialize_inode(node: &mut INode, at: u64) -> Vec<u8> {
    node.start_offset = at;
    let own_size = node.serialized_size();
    node.end_offset = at + own_size - 1;
    let mut next = at + own_size;

    let mut leaf_bytes = None;
    let leaf_offset = match &mut node.leaf {
        Some(leaf) if leaf.version == node.version => {
            leaf.start_offset = next;
            leaf.end_offset = next + leaf.serialized_size() - 1;
            next = leaf.end_offset + 1;
            leaf_bytes = Some(encode_lnode(leaf));
            leaf.start_offset
        }
        Some(leaf) => leaf.start_offset,
        None => 0,
    };

    let mut table = Vec::with_capacity(node.children.len() * CHILD_PTR_SIZE as usize);
    let mut subtrees = Vec::new();
    for child in &mut node.children {
        match child {
            ChildRef::Disk(offset) => table.write_u64::<LittleEndian>(*offset).unwrap(),
            ChildRef::Live(child_node) => {
                let body = serialize_inode(child_node, next);
                table.write_u64::<LittleEndian>(child_node.start_offset).unwrap();
                next += body.len() as u64;
                subtrees.extend_from_slice(&body);
            }
        }
    }

    let mut out = Vec::with_capacity((next - at) as usize);
    out.write_u64::<LittleEndian>(node.version).unwrap();
    out.write_u64::<LittleEndian>(node.start_offset).unwrap();
    out.write_u64::<LittleEndian>(node.end_offset).unwrap();
    for word in node.bitmap.words() {
        out.write_u32::<LittleEndian>(*word).unwrap();
    }
    out.write_u64::<LittleEndian>(leaf_offset).unwrap();
    out.extend_from_slice(&table);
    if let Some(bytes) = leaf_bytes {
        out.extend_from_slice(&bytes);
    }
    out.extend_from_slice(&subtrees);
    out
}

fn encode_lnode(leaf: &LNode) -> Vec<u8> {
    let mut out = Vec::with_capacity(leaf.serialized_size() as usize);
    out.write_u64::<LittleEndian>(leaf.version).unwrap();
    out.write_u64::<LittleEndian>(leaf.start_offset).unwrap();
    out.write_u64::<LittleEndian>(leaf.end_offset).unwrap();
    out.write_u16::<LittleEndian>(leaf.key.len() as u16).unwrap();
    out.extend_from_slice(&leaf.key);
    out.extend_from_slice(&leaf.value);
    out
}
