mod node;

pub use node::{common_prefix_len, from_nibbles, to_nibbles, Node};

use super::storage::{Storage, StorageError};
use log::trace;
use neb_common::{
    crypto::{hash, Hash},
    serializer::{ReaderError, Serializer},
};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrieError {
    #[error("A batch is already in progress")]
    NestedBatch,

    #[error("No batch in progress")]
    NotInBatch,

    #[error("Cannot clone a trie while a batch is in progress")]
    CloneInBatch,

    #[error("Key not found in trie")]
    KeyNotFound,

    #[error("Missing trie node {0}")]
    MissingNode(Hash),

    #[error("Corrupted trie node: {0}")]
    InvalidNode(#[from] ReaderError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

// Merkle proof for one key: the serialized nodes on the path from the
// root down to the leaf holding the value.
pub type MerkleProof = Vec<Vec<u8>>;

// A Merkle-Patricia trie with batch semantics over content-addressed
// node storage. Outside a batch, writes land in storage immediately.
// Between begin_batch and commit, new nodes are staged in memory;
// rollback discards them and restores the pre-batch root. The root
// hash observed during a batch reflects the staged state.
pub struct OverlayTrie {
    storage: Arc<dyn Storage>,
    root: Hash,
    staged: HashMap<Hash, Vec<u8>>,
    batch_root: Option<Hash>,
}

impl OverlayTrie {
    // Fresh empty trie; the empty root is the zero hash
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        OverlayTrie {
            storage,
            root: Hash::zero(),
            staged: HashMap::new(),
            batch_root: None,
        }
    }

    // Reopen a trie at a known root. A non-empty root must resolve to a
    // stored node.
    pub fn open(storage: Arc<dyn Storage>, root: Hash) -> Result<Self, TrieError> {
        if !root.is_zero() && storage.get(root.as_bytes())?.is_none() {
            return Err(TrieError::MissingNode(root));
        }
        Ok(OverlayTrie {
            storage,
            root,
            staged: HashMap::new(),
            batch_root: None,
        })
    }

    // Independent overlay over the same backing storage at the current root
    pub fn try_clone(&self) -> Result<Self, TrieError> {
        if self.batch_root.is_some() {
            return Err(TrieError::CloneInBatch);
        }
        Ok(OverlayTrie {
            storage: Arc::clone(&self.storage),
            root: self.root.clone(),
            staged: HashMap::new(),
            batch_root: None,
        })
    }

    pub fn root_hash(&self) -> Hash {
        self.root.clone()
    }

    pub fn is_batching(&self) -> bool {
        self.batch_root.is_some()
    }

    pub fn begin_batch(&mut self) -> Result<(), TrieError> {
        if self.batch_root.is_some() {
            return Err(TrieError::NestedBatch);
        }
        self.batch_root = Some(self.root.clone());
        Ok(())
    }

    // Flush staged nodes to storage and close the batch
    pub fn commit(&mut self) -> Result<(), TrieError> {
        if self.batch_root.take().is_none() {
            return Err(TrieError::NotInBatch);
        }
        for (node_hash, bytes) in self.staged.drain() {
            self.storage.put(node_hash.as_bytes(), &bytes)?;
        }
        Ok(())
    }

    // Discard staged nodes and restore the pre-batch root
    pub fn rollback(&mut self) -> Result<(), TrieError> {
        match self.batch_root.take() {
            Some(root) => {
                self.staged.clear();
                self.root = root;
                Ok(())
            }
            None => Err(TrieError::NotInBatch),
        }
    }

    fn load_node(&self, node_hash: &Hash) -> Result<Node, TrieError> {
        if let Some(bytes) = self.staged.get(node_hash) {
            return Ok(Node::from_bytes(bytes)?);
        }
        match self.storage.get(node_hash.as_bytes())? {
            Some(bytes) => Ok(Node::from_bytes(&bytes)?),
            None => Err(TrieError::MissingNode(node_hash.clone())),
        }
    }

    fn store_node(&mut self, node: &Node) -> Result<Hash, TrieError> {
        let bytes = node.to_bytes();
        let node_hash = hash(&bytes);
        if self.batch_root.is_some() {
            self.staged.insert(node_hash.clone(), bytes);
        } else {
            self.storage.put(node_hash.as_bytes(), &bytes)?;
        }
        Ok(node_hash)
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool, TrieError> {
        Ok(self.get(key)?.is_some())
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
        if self.root.is_zero() {
            return Ok(None);
        }
        let path = to_nibbles(key);
        let mut current = self.root.clone();
        let mut offset = 0;
        loop {
            match self.load_node(&current)? {
                Node::Leaf {
                    path: leaf_path,
                    value,
                } => {
                    return Ok((leaf_path == path[offset..]).then_some(value));
                }
                Node::Extension {
                    path: ext_path,
                    child,
                } => {
                    if path[offset..].starts_with(&ext_path) {
                        offset += ext_path.len();
                        current = child;
                    } else {
                        return Ok(None);
                    }
                }
                Node::Branch { children, value } => {
                    if offset == path.len() {
                        return Ok(value);
                    }
                    match &children[path[offset] as usize] {
                        Some(child) => {
                            current = child.clone();
                            offset += 1;
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), TrieError> {
        let path = to_nibbles(key);
        let root = if self.root.is_zero() { None } else { Some(self.root.clone()) };
        self.root = self.insert_rec(root, &path, value.to_vec())?;
        trace!("trie root is now {}", self.root);
        Ok(())
    }

    fn insert_rec(
        &mut self,
        node: Option<Hash>,
        path: &[u8],
        value: Vec<u8>,
    ) -> Result<Hash, TrieError> {
        let Some(node_hash) = node else {
            return self.store_node(&Node::Leaf {
                path: path.to_vec(),
                value,
            });
        };

        match self.load_node(&node_hash)? {
            Node::Leaf {
                path: leaf_path,
                value: leaf_value,
            } => {
                let common = common_prefix_len(&leaf_path, path);
                if common == leaf_path.len() && common == path.len() {
                    // same key, replace the value
                    return self.store_node(&Node::Leaf {
                        path: leaf_path,
                        value,
                    });
                }

                let mut children: Box<[Option<Hash>; 16]> = Box::new(Default::default());
                let mut branch_value = None;
                if leaf_path.len() == common {
                    branch_value = Some(leaf_value);
                } else {
                    let idx = leaf_path[common] as usize;
                    children[idx] = Some(self.store_node(&Node::Leaf {
                        path: leaf_path[common + 1..].to_vec(),
                        value: leaf_value,
                    })?);
                }
                if path.len() == common {
                    branch_value = Some(value);
                } else {
                    let idx = path[common] as usize;
                    children[idx] = Some(self.store_node(&Node::Leaf {
                        path: path[common + 1..].to_vec(),
                        value,
                    })?);
                }
                let branch = self.store_node(&Node::Branch {
                    children,
                    value: branch_value,
                })?;
                if common > 0 {
                    self.store_node(&Node::Extension {
                        path: path[..common].to_vec(),
                        child: branch,
                    })
                } else {
                    Ok(branch)
                }
            }
            Node::Extension {
                path: ext_path,
                child,
            } => {
                let common = common_prefix_len(&ext_path, path);
                if common == ext_path.len() {
                    let new_child = self.insert_rec(Some(child), &path[common..], value)?;
                    return self.store_node(&Node::Extension {
                        path: ext_path,
                        child: new_child,
                    });
                }

                // diverge inside the extension: split it around a branch
                let mut children: Box<[Option<Hash>; 16]> = Box::new(Default::default());
                let mut branch_value = None;
                {
                    let idx = ext_path[common] as usize;
                    let rest = &ext_path[common + 1..];
                    let child_hash = if rest.is_empty() {
                        child
                    } else {
                        self.store_node(&Node::Extension {
                            path: rest.to_vec(),
                            child,
                        })?
                    };
                    children[idx] = Some(child_hash);
                }
                if path.len() == common {
                    branch_value = Some(value);
                } else {
                    let idx = path[common] as usize;
                    children[idx] = Some(self.store_node(&Node::Leaf {
                        path: path[common + 1..].to_vec(),
                        value,
                    })?);
                }
                let branch = self.store_node(&Node::Branch {
                    children,
                    value: branch_value,
                })?;
                if common > 0 {
                    self.store_node(&Node::Extension {
                        path: path[..common].to_vec(),
                        child: branch,
                    })
                } else {
                    Ok(branch)
                }
            }
            Node::Branch {
                mut children,
                value: branch_value,
            } => {
                if path.is_empty() {
                    return self.store_node(&Node::Branch {
                        children,
                        value: Some(value),
                    });
                }
                let idx = path[0] as usize;
                let new_child = self.insert_rec(children[idx].clone(), &path[1..], value)?;
                children[idx] = Some(new_child);
                self.store_node(&Node::Branch {
                    children,
                    value: branch_value,
                })
            }
        }
    }

    // Membership proof: the serialized nodes on the path to the key.
    // Returns KeyNotFound when the key is absent.
    pub fn prove(&self, key: &[u8]) -> Result<MerkleProof, TrieError> {
        if self.root.is_zero() {
            return Err(TrieError::KeyNotFound);
        }
        let path = to_nibbles(key);
        let mut proof = Vec::new();
        let mut current = self.root.clone();
        let mut offset = 0;
        loop {
            let node = self.load_node(&current)?;
            proof.push(node.to_bytes());
            match node {
                Node::Leaf {
                    path: leaf_path, ..
                } => {
                    if leaf_path == path[offset..] {
                        return Ok(proof);
                    }
                    return Err(TrieError::KeyNotFound);
                }
                Node::Extension {
                    path: ext_path,
                    child,
                } => {
                    if path[offset..].starts_with(&ext_path) {
                        offset += ext_path.len();
                        current = child;
                    } else {
                        return Err(TrieError::KeyNotFound);
                    }
                }
                Node::Branch { children, value } => {
                    if offset == path.len() {
                        if value.is_some() {
                            return Ok(proof);
                        }
                        return Err(TrieError::KeyNotFound);
                    }
                    match &children[path[offset] as usize] {
                        Some(child) => {
                            current = child.clone();
                            offset += 1;
                        }
                        None => return Err(TrieError::KeyNotFound),
                    }
                }
            }
        }
    }

    // All entries whose key starts with the given byte prefix, in
    // ascending key order.
    pub fn iterator(&self, prefix: &[u8]) -> Result<TrieIterator, TrieError> {
        let mut entries = Vec::new();
        if !self.root.is_zero() {
            let root = self.root.clone();
            self.collect(&root, &to_nibbles(prefix), Vec::new(), &mut entries)?;
        }
        Ok(TrieIterator {
            inner: entries.into_iter(),
        })
    }

    fn collect(
        &self,
        node_hash: &Hash,
        pending: &[u8],
        consumed: Vec<u8>,
        out: &mut Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<(), TrieError> {
        match self.load_node(node_hash)? {
            Node::Leaf { path, value } => {
                if path.len() >= pending.len() && path[..pending.len()] == *pending {
                    let mut full = consumed;
                    full.extend_from_slice(&path);
                    out.push((from_nibbles(&full), value));
                }
                Ok(())
            }
            Node::Extension { path, child } => {
                let n = path.len().min(pending.len());
                if path[..n] == pending[..n] {
                    let mut full = consumed;
                    full.extend_from_slice(&path);
                    self.collect(&child, &pending[n..], full, out)
                } else {
                    Ok(())
                }
            }
            Node::Branch { children, value } => {
                if pending.is_empty() {
                    if let Some(value) = value {
                        out.push((from_nibbles(&consumed), value));
                    }
                    for (i, child) in children.iter().enumerate() {
                        if let Some(child) = child {
                            let mut full = consumed.clone();
                            full.push(i as u8);
                            self.collect(child, &[], full, out)?;
                        }
                    }
                    Ok(())
                } else {
                    let idx = pending[0] as usize;
                    match &children[idx] {
                        Some(child) => {
                            let mut full = consumed;
                            full.push(idx as u8);
                            self.collect(child, &pending[1..], full, out)
                        }
                        None => Ok(()),
                    }
                }
            }
        }
    }
}

pub struct TrieIterator {
    inner: std::vec::IntoIter<(Vec<u8>, Vec<u8>)>,
}

impl Iterator for TrieIterator {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

// Check a membership proof against a known root
pub fn verify_proof(root: &Hash, key: &[u8], expected_value: &[u8], proof: &[Vec<u8>]) -> bool {
    let path = to_nibbles(key);
    let mut offset = 0;
    let mut want = root.clone();
    let mut nodes = proof.iter().peekable();

    while let Some(bytes) = nodes.next() {
        if hash(bytes) != want {
            return false;
        }
        let Ok(node) = Node::from_bytes(bytes) else {
            return false;
        };
        match node {
            Node::Leaf {
                path: leaf_path,
                value,
            } => {
                return nodes.peek().is_none()
                    && leaf_path == path[offset..]
                    && value == expected_value;
            }
            Node::Extension {
                path: ext_path,
                child,
            } => {
                if !path[offset..].starts_with(&ext_path) {
                    return false;
                }
                offset += ext_path.len();
                want = child;
            }
            Node::Branch { children, value } => {
                if offset == path.len() {
                    return nodes.peek().is_none() && value.as_deref() == Some(expected_value);
                }
                match &children[path[offset] as usize] {
                    Some(child) => {
                        want = child.clone();
                        offset += 1;
                    }
                    None => return false,
                }
            }
        }
    }
    false
}
