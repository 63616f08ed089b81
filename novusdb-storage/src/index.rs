//! Persistent B-tree secondary index: byte-string key to record locations.

pub mod btree;
pub mod ordered_key;

pub use btree::BTree;
pub use ordered_key::encode_sortable_key;
