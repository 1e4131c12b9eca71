//! # sqlfs-tree
//!
//! Virtual hierarchical filesystem ("SQLFS") persisted as flat relational
//! rows. The in-memory tree is an arena of nodes keyed by stable ids; parent
//! and child links are id-valued, never owning pointers. Every structural
//! mutation updates the arena and then writes the affected rows back through
//! the persistence backend, all under one process-wide mutation lock.
//!
//! Directory rows embed their file children inline; only directories get
//! rows of their own. File bytes live in the [`ContentStore`], referenced by
//! content id and shared through refcounts, so copies never duplicate bytes.
//!
//! Access control is evaluated by the [`permissions`] module against an
//! opaque caller [`Identity`].

pub mod permissions;

pub use permissions::{AccessMode, Identity, SYSTEM_HANDLE};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use sqlfs_backend::{BackendError, SqlBackend, Value};
use sqlfs_store::{ContentId, ContentStore, StoreError};

/// Placeholder for names that sanitize down to nothing (or are reserved).
const FALLBACK_NAME: &str = "untitled";

/// Characters stripped from user-supplied names before they enter the tree.
const UNSAFE_NAME_CHARS: &str = "\\/*<>?`'\"|";

/// Errors from filesystem operations.
///
/// Expected negative outcomes are typed variants, never panics; `resolve`
/// stays `Option` because an unresolved path is an ordinary answer.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("path or node not found")]
    NotFound,

    #[error("not a directory")]
    NotADirectory,

    #[error("source already lives under the target directory")]
    SameParent,

    #[error("target directory lies inside the subtree being moved or copied")]
    CyclicTarget,

    #[error("the root cannot be renamed")]
    RenameRoot,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Stable handle of one tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub Uuid);

impl NodeId {
    fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Six independent access bits: `{owner, other} × {read, write, traverse}`.
///
/// The textual form matches position-for-position against `rwxrwx`
/// (owner triple first): `"rw-r--"` grants the owner read and write and
/// everyone else read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionBits {
    pub owner_read: bool,
    pub owner_write: bool,
    pub owner_traverse: bool,
    pub other_read: bool,
    pub other_write: bool,
    pub other_traverse: bool,
}

impl Default for PermissionBits {
    fn default() -> Self {
        Self {
            owner_read: true,
            owner_write: true,
            owner_traverse: false,
            other_read: false,
            other_write: false,
            other_traverse: false,
        }
    }
}

impl PermissionBits {
    pub fn parse(text: &str) -> Option<Self> {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() != 6 {
            return None;
        }
        const PATTERN: [char; 6] = ['r', 'w', 'x', 'r', 'w', 'x'];
        Some(Self {
            owner_read: chars[0] == PATTERN[0],
            owner_write: chars[1] == PATTERN[1],
            owner_traverse: chars[2] == PATTERN[2],
            other_read: chars[3] == PATTERN[3],
            other_write: chars[4] == PATTERN[4],
            other_traverse: chars[5] == PATTERN[5],
        })
    }

    pub fn allows(&self, owner: bool, mode: AccessMode) -> bool {
        match (owner, mode) {
            (true, AccessMode::Read) => self.owner_read,
            (true, AccessMode::Write) => self.owner_write,
            (true, AccessMode::Traverse) => self.owner_traverse,
            (false, AccessMode::Read) => self.other_read,
            (false, AccessMode::Write) => self.other_write,
            (false, AccessMode::Traverse) => self.other_traverse,
        }
    }
}

impl std::fmt::Display for PermissionBits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bits = [
            (self.owner_read, 'r'),
            (self.owner_write, 'w'),
            (self.owner_traverse, 'x'),
            (self.other_read, 'r'),
            (self.other_write, 'w'),
            (self.other_traverse, 'x'),
        ];
        for (set, c) in bits {
            write!(f, "{}", if set { c } else { '-' })?;
        }
        Ok(())
    }
}

/// Owner field: a set of identity handles (or group names).
pub type OwnerSet = BTreeSet<String>;

/// Build an owner set from handles. Convenience for callers and tests.
pub fn owner_set(handles: &[&str]) -> OwnerSet {
    handles.iter().map(|h| h.to_string()).collect()
}

#[derive(Debug, Clone)]
pub(crate) enum NodeKind {
    Directory {
        /// Children indexed by name; sibling names are unique.
        children: HashMap<String, NodeId>,
    },
    File {
        content: ContentId,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) owners: OwnerSet,
    pub(crate) perms: PermissionBits,
    pub(crate) created_at: f64,
    pub(crate) parent: Option<NodeId>,
    pub(crate) kind: NodeKind,
}

impl Node {
    pub(crate) fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    fn children(&self) -> Option<&HashMap<String, NodeId>> {
        match &self.kind {
            NodeKind::Directory { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }

    fn children_mut(&mut self) -> Option<&mut HashMap<String, NodeId>> {
        match &mut self.kind {
            NodeKind::Directory { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }

    fn content(&self) -> Option<ContentId> {
        match &self.kind {
            NodeKind::Directory { .. } => None,
            NodeKind::File { content } => Some(*content),
        }
    }
}

/// The arena: sole owner of all node storage.
pub(crate) struct TreeState {
    pub(crate) nodes: HashMap<NodeId, Node>,
    pub(crate) root: NodeId,
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirEntry {
    pub name: String,
    /// Referenced content size for files, 0 for directories.
    pub size: u64,
    pub is_dir: bool,
    pub owners: OwnerSet,
    pub permissions: PermissionBits,
    pub created_at: f64,
}

/// The filesystem service. One mutation lock serializes every structural
/// change for its full duration, including the synchronous row write; reads
/// take the same lock so a partially updated tree is never observable.
pub struct Filesystem {
    backend: Arc<dyn SqlBackend>,
    store: Arc<ContentStore>,
    state: Mutex<TreeState>,
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !c.is_control() && !UNSAFE_NAME_CHARS.contains(*c))
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => FALLBACK_NAME.to_string(),
        _ => cleaned,
    }
}

/// Probe `name`, `stem (2)suffix`, `stem (3)suffix`, … until no sibling
/// claims it. Sibling sets are finite, so this terminates.
fn resolve_conflict(siblings: &HashMap<String, NodeId>, name: String) -> String {
    if !siblings.contains_key(&name) {
        return name;
    }
    let (stem, suffix) = match name.rfind('.') {
        Some(i) => (&name[..i], &name[i..]),
        None => (name.as_str(), ""),
    };
    let mut n: u64 = 2;
    loop {
        let candidate = format!("{stem} ({n}){suffix}");
        if !siblings.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn join_owners(owners: &OwnerSet) -> String {
    owners.iter().cloned().collect::<Vec<_>>().join(";")
}

fn split_owners(field: &str) -> OwnerSet {
    field
        .split(';')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Loader-only representation of one inline file child.
struct RawFile {
    id: NodeId,
    name: String,
    owners: OwnerSet,
    perms: PermissionBits,
    created_at: f64,
    content: ContentId,
}

/// Loader-only representation of one directory row.
struct RawDir {
    id: NodeId,
    name: String,
    owners: OwnerSet,
    perms: PermissionBits,
    created_at: f64,
    child_dirs: Vec<NodeId>,
    files: Vec<RawFile>,
}

fn parse_file_tuple(tuple: &[String]) -> Option<RawFile> {
    if tuple.len() < 6 {
        return None;
    }
    Some(RawFile {
        id: NodeId::parse(&tuple[0])?,
        name: tuple[1].clone(),
        owners: split_owners(&tuple[2]),
        perms: PermissionBits::parse(&tuple[3]).unwrap_or_default(),
        created_at: tuple[4].parse().ok()?,
        content: ContentId::parse(&tuple[5])?,
    })
}

impl Filesystem {
    /// Reconstruct the tree from the backing rows.
    ///
    /// Two-phase: every row is first read into a loader representation, then
    /// cross-references are resolved once all rows are known. Orphaned child
    /// ids and file children whose content no longer exists are dropped;
    /// corruption never aborts the load. An empty store gets a synthesized
    /// root, so the filesystem is never rootless.
    pub fn load(backend: Arc<dyn SqlBackend>, store: Arc<ContentStore>) -> Result<Self> {
        let rows = backend.execute(
            "SELECT id, name, owner, permission_bits, created_at, child_dir_ids, \
             child_file_rows FROM file_system",
            &[],
        )?;

        let mut raw_dirs = Vec::new();
        for row in rows {
            let parsed = (|| {
                let id = NodeId::parse(row.first()?.as_str()?)?;
                let name = row.get(1)?.as_str()?.to_string();
                let owners = split_owners(row.get(2)?.as_str()?);
                let perms = PermissionBits::parse(row.get(3)?.as_str()?).unwrap_or_default();
                let created_at = row.get(4)?.as_f64()?;
                let child_dirs = row
                    .get(5)?
                    .as_text_array()?
                    .iter()
                    .filter_map(|s| NodeId::parse(s))
                    .collect();
                let files = row
                    .get(6)?
                    .as_text_matrix()?
                    .iter()
                    .filter_map(|t| parse_file_tuple(t))
                    .filter(|f| {
                        // Dangling content reference: drop the entry.
                        let live = store.contains(f.content);
                        if !live {
                            warn!(file = %f.id, "dropping file child with unknown content");
                        }
                        live
                    })
                    .collect();
                Some(RawDir {
                    id,
                    name,
                    owners,
                    perms,
                    created_at,
                    child_dirs,
                    files,
                })
            })();
            match parsed {
                Some(dir) => raw_dirs.push(dir),
                None => warn!("skipping malformed file_system row"),
            }
        }

        // Phase two: materialize the arena and attach children.
        let mut nodes: HashMap<NodeId, Node> = HashMap::new();
        for dir in &raw_dirs {
            nodes.insert(
                dir.id,
                Node {
                    id: dir.id,
                    name: dir.name.clone(),
                    owners: dir.owners.clone(),
                    perms: dir.perms,
                    created_at: dir.created_at,
                    parent: None,
                    kind: NodeKind::Directory {
                        children: HashMap::new(),
                    },
                },
            );
            for file in &dir.files {
                nodes.insert(
                    file.id,
                    Node {
                        id: file.id,
                        name: file.name.clone(),
                        owners: file.owners.clone(),
                        perms: file.perms,
                        created_at: file.created_at,
                        parent: None,
                        kind: NodeKind::File {
                            content: file.content,
                        },
                    },
                );
            }
        }
        for dir in &raw_dirs {
            let mut attach = Vec::new();
            for file in &dir.files {
                attach.push(file.id);
            }
            for &child in &dir.child_dirs {
                match nodes.get(&child) {
                    Some(node) if node.is_dir() => attach.push(child),
                    // Row referenced a directory that was never loaded.
                    _ => warn!(parent = %dir.id, %child, "dropping orphaned child reference"),
                }
            }
            for child_id in attach {
                let (child_name, already_parented) = {
                    let child = &nodes[&child_id];
                    (child.name.clone(), child.parent.is_some())
                };
                if already_parented {
                    continue;
                }
                nodes
                    .get_mut(&dir.id)
                    .and_then(Node::children_mut)
                    .map(|c| c.insert(child_name, child_id));
                if let Some(child) = nodes.get_mut(&child_id) {
                    child.parent = Some(dir.id);
                }
            }
        }

        // Walk up from an arbitrary node to find the root.
        let root = nodes.keys().next().copied().map(|mut cur| {
            let mut steps = nodes.len() + 1;
            while let Some(parent) = nodes.get(&cur).and_then(|n| n.parent) {
                cur = parent;
                steps -= 1;
                if steps == 0 {
                    break; // cyclic corruption; take what we have
                }
            }
            cur
        });

        let fs = Self {
            backend,
            store,
            state: Mutex::new(TreeState {
                nodes,
                root: root.unwrap_or(NodeId(Uuid::nil())),
            }),
        };
        {
            let mut state = fs.state.lock();
            if root.is_none() {
                fs.make_root(&mut state)?;
            }
            debug!(nodes = state.nodes.len(), root = %state.root, "filesystem loaded");
        }
        Ok(fs)
    }

    /// The root node handle.
    pub fn root(&self) -> NodeId {
        self.state.lock().root
    }

    /// Resolve a `/`-separated path from the root. Empty segments are
    /// discarded, so `"/docs//notes.txt"` and `"docs/notes.txt"` agree.
    pub fn resolve(&self, path: &str) -> Option<NodeId> {
        let state = self.state.lock();
        let mut cur = state.root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            cur = *state.nodes.get(&cur)?.children()?.get(segment)?;
        }
        Some(cur)
    }

    /// Resolve a single name directly under `parent`, non-recursively.
    pub fn resolve_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let state = self.state.lock();
        state.nodes.get(&parent)?.children()?.get(name).copied()
    }

    /// Create a file under `parent`; content is stored (and deduplicated)
    /// through the content store. Returns the new node's id; the final name
    /// may differ from `name` after sanitation and conflict resolution.
    pub fn create_file(
        &self,
        parent: NodeId,
        name: &str,
        owners: OwnerSet,
        content: &[u8],
    ) -> Result<NodeId> {
        let mut state = self.state.lock();
        let siblings = state
            .nodes
            .get(&parent)
            .ok_or(FsError::NotFound)?
            .children()
            .ok_or(FsError::NotADirectory)?;
        let name = resolve_conflict(siblings, sanitize_name(name));

        let content_id = self.store.store(content)?;
        let id = NodeId::generate();
        state.nodes.insert(
            id,
            Node {
                id,
                name: name.clone(),
                owners,
                perms: PermissionBits::default(),
                created_at: now_epoch(),
                parent: Some(parent),
                kind: NodeKind::File {
                    content: content_id,
                },
            },
        );
        state
            .nodes
            .get_mut(&parent)
            .and_then(Node::children_mut)
            .map(|c| c.insert(name, id));
        self.persist_dir(&state, parent)?;
        debug!(%id, %parent, "file created");
        Ok(id)
    }

    /// Create an empty directory under `parent`.
    pub fn create_directory(&self, parent: NodeId, name: &str, owners: OwnerSet) -> Result<NodeId> {
        let mut state = self.state.lock();
        let siblings = state
            .nodes
            .get(&parent)
            .ok_or(FsError::NotFound)?
            .children()
            .ok_or(FsError::NotADirectory)?;
        let name = resolve_conflict(siblings, sanitize_name(name));

        let id = NodeId::generate();
        state.nodes.insert(
            id,
            Node {
                id,
                name: name.clone(),
                owners,
                perms: PermissionBits::default(),
                created_at: now_epoch(),
                parent: Some(parent),
                kind: NodeKind::Directory {
                    children: HashMap::new(),
                },
            },
        );
        state
            .nodes
            .get_mut(&parent)
            .and_then(Node::children_mut)
            .map(|c| c.insert(name, id));
        self.persist_dir(&state, parent)?;
        self.persist_dir(&state, id)?;
        debug!(%id, %parent, "directory created");
        Ok(id)
    }

    /// Re-hang `source` under `target_parent`.
    ///
    /// A move to the current parent is a forbidden no-op, and the target may
    /// not lie inside the moved subtree (that includes moving the root).
    pub fn move_node(&self, source: NodeId, target_parent: NodeId) -> Result<()> {
        let mut state = self.state.lock();
        let node = state.nodes.get(&source).ok_or(FsError::NotFound)?;
        let old_parent = node.parent;
        if !state
            .nodes
            .get(&target_parent)
            .ok_or(FsError::NotFound)?
            .is_dir()
        {
            return Err(FsError::NotADirectory);
        }
        if old_parent == Some(target_parent) {
            return Err(FsError::SameParent);
        }
        if is_descendant(&state, target_parent, source) {
            return Err(FsError::CyclicTarget);
        }
        let old_parent = old_parent.expect("non-root: root is every node's ancestor");

        let old_name = state.nodes[&source].name.clone();
        state
            .nodes
            .get_mut(&old_parent)
            .and_then(Node::children_mut)
            .map(|c| c.remove(&old_name));

        let new_name = {
            let siblings = state.nodes[&target_parent]
                .children()
                .expect("checked directory above");
            resolve_conflict(siblings, sanitize_name(&old_name))
        };
        if let Some(node) = state.nodes.get_mut(&source) {
            node.name = new_name.clone();
            node.parent = Some(target_parent);
        }
        state
            .nodes
            .get_mut(&target_parent)
            .and_then(Node::children_mut)
            .map(|c| c.insert(new_name, source));

        self.persist_dir(&state, old_parent)?;
        self.persist_dir(&state, target_parent)?;
        debug!(%source, from = %old_parent, to = %target_parent, "node moved");
        Ok(())
    }

    /// Structural deep copy of `source` under `target_parent`.
    ///
    /// Every duplicated node gets a fresh id and timestamp; file content is
    /// shared by reference count, never copied byte-wise. `new_owner`, when
    /// given, replaces ownership across the whole duplicate.
    pub fn copy_node(
        &self,
        source: NodeId,
        target_parent: NodeId,
        new_owner: Option<OwnerSet>,
    ) -> Result<NodeId> {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&source) {
            return Err(FsError::NotFound);
        }
        if !state
            .nodes
            .get(&target_parent)
            .ok_or(FsError::NotFound)?
            .is_dir()
        {
            return Err(FsError::NotADirectory);
        }
        if is_descendant(&state, target_parent, source) {
            return Err(FsError::CyclicTarget);
        }

        let top_name = {
            let siblings = state.nodes[&target_parent]
                .children()
                .expect("checked directory above");
            resolve_conflict(siblings, sanitize_name(&state.nodes[&source].name))
        };
        let now = now_epoch();
        let mut new_dirs = Vec::new();
        let copy = self.duplicate(
            &mut state,
            source,
            target_parent,
            top_name,
            new_owner.as_ref(),
            now,
            &mut new_dirs,
        )?;
        for dir in new_dirs {
            self.persist_dir(&state, dir)?;
        }
        self.persist_dir(&state, target_parent)?;
        debug!(%source, %copy, under = %target_parent, "subtree copied");
        Ok(copy)
    }

    /// Remove a node and, recursively, everything beneath it. Content
    /// references of file descendants are released; removing the root
    /// immediately synthesizes a fresh one.
    pub fn remove(&self, node: NodeId) -> Result<()> {
        let mut state = self.state.lock();
        let target = state.nodes.get(&node).ok_or(FsError::NotFound)?;
        let parent = target.parent;
        let name = target.name.clone();

        self.destroy(&mut state, node)?;

        if let Some(parent) = parent {
            state
                .nodes
                .get_mut(&parent)
                .and_then(Node::children_mut)
                .map(|c| c.remove(&name));
            self.persist_dir(&state, parent)?;
        }
        if state.root == node {
            self.make_root(&mut state)?;
        }
        debug!(%node, "subtree removed");
        Ok(())
    }

    /// Rename a node in place. The root has no siblings to resolve against
    /// and cannot be renamed.
    pub fn rename(&self, node: NodeId, new_name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let target = state.nodes.get(&node).ok_or(FsError::NotFound)?;
        let parent = target.parent.ok_or(FsError::RenameRoot)?;
        let old_name = target.name.clone();

        let new_name = {
            let siblings = state.nodes[&parent]
                .children()
                .expect("parent is a directory");
            resolve_conflict(siblings, sanitize_name(new_name))
        };
        state
            .nodes
            .get_mut(&parent)
            .and_then(Node::children_mut)
            .map(|c| c.remove(&old_name));
        if let Some(n) = state.nodes.get_mut(&node) {
            n.name = new_name.clone();
        }
        state
            .nodes
            .get_mut(&parent)
            .and_then(Node::children_mut)
            .map(|c| c.insert(new_name, node));

        if state.nodes[&node].is_dir() {
            self.persist_dir(&state, node)?;
        }
        self.persist_dir(&state, parent)?;
        Ok(())
    }

    /// Assign new owners to a node and every descendant.
    pub fn change_owner(&self, node: NodeId, owners: OwnerSet) -> Result<()> {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&node) {
            return Err(FsError::NotFound);
        }
        let subtree = collect_subtree(&state, node);
        for &id in &subtree {
            if let Some(n) = state.nodes.get_mut(&id) {
                n.owners = owners.clone();
            }
        }
        self.persist_subtree_rows(&state, &subtree)
    }

    /// Apply permission bits to one node, or to the whole subtree.
    pub fn change_permissions(
        &self,
        node: NodeId,
        bits: PermissionBits,
        recursive: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&node) {
            return Err(FsError::NotFound);
        }
        let targets = if recursive {
            collect_subtree(&state, node)
        } else {
            vec![node]
        };
        for &id in &targets {
            if let Some(n) = state.nodes.get_mut(&id) {
                n.perms = bits;
            }
        }
        self.persist_subtree_rows(&state, &targets)
    }

    /// List the direct children of a directory, sorted by name. Entries
    /// whose content reference cannot be resolved are silently skipped;
    /// non-directories list as empty.
    pub fn list_children(&self, node: NodeId) -> Vec<DirEntry> {
        let state = self.state.lock();
        let Some(children) = state.nodes.get(&node).and_then(Node::children) else {
            return Vec::new();
        };
        let mut entries: Vec<DirEntry> = children
            .values()
            .filter_map(|id| {
                let child = state.nodes.get(id)?;
                let size = match child.content() {
                    None => 0,
                    Some(content) => self.store.size_of(content)?,
                };
                Some(DirEntry {
                    name: child.name.clone(),
                    size,
                    is_dir: child.is_dir(),
                    owners: child.owners.clone(),
                    permissions: child.perms,
                    created_at: child.created_at,
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Bytes of a file node. Directories and unknown nodes read as empty.
    pub fn content(&self, node: NodeId) -> Result<Vec<u8>> {
        let content = {
            let state = self.state.lock();
            state.nodes.get(&node).and_then(Node::content)
        };
        match content {
            Some(id) => Ok(self.store.retrieve(id)?),
            None => Ok(Vec::new()),
        }
    }

    /// Listing-shaped view of a single node.
    pub fn entry(&self, node: NodeId) -> Option<DirEntry> {
        let state = self.state.lock();
        let n = state.nodes.get(&node)?;
        let size = match n.content() {
            None => 0,
            Some(content) => self.store.size_of(content).unwrap_or(0),
        };
        Some(DirEntry {
            name: n.name.clone(),
            size,
            is_dir: n.is_dir(),
            owners: n.owners.clone(),
            permissions: n.perms,
            created_at: n.created_at,
        })
    }

    /// The content id a file node points at.
    pub fn content_id(&self, node: NodeId) -> Option<ContentId> {
        self.state.lock().nodes.get(&node).and_then(Node::content)
    }

    /// Parent handle; `None` for the root (and for unknown nodes).
    pub fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.state.lock().nodes.get(&node).and_then(|n| n.parent)
    }

    // ------------------------------------------------------------------
    // Permission checks (see the `permissions` module for the semantics).
    // ------------------------------------------------------------------

    pub fn is_accessible(&self, node: NodeId, who: &Identity, mode: AccessMode) -> bool {
        let state = self.state.lock();
        permissions::accessible(&state, node, who, mode)
    }

    pub fn readable(&self, node: NodeId, who: &Identity) -> bool {
        self.is_accessible(node, who, AccessMode::Read)
    }

    pub fn writable(&self, node: NodeId, who: &Identity) -> bool {
        self.is_accessible(node, who, AccessMode::Write)
    }

    /// Whether the whole subtree under (and including) `node` is readable.
    /// Gate for destructive recursive reads.
    pub fn readable_all(&self, node: NodeId, who: &Identity) -> bool {
        let state = self.state.lock();
        permissions::accessible_all(&state, node, who, AccessMode::Read)
    }

    /// Whether the whole subtree under (and including) `node` is writable.
    pub fn writable_all(&self, node: NodeId, who: &Identity) -> bool {
        let state = self.state.lock();
        permissions::accessible_all(&state, node, who, AccessMode::Write)
    }

    /// Read and write in one check.
    pub fn read_writable(&self, node: NodeId, who: &Identity) -> bool {
        let state = self.state.lock();
        permissions::accessible(&state, node, who, AccessMode::Read)
            && permissions::accessible(&state, node, who, AccessMode::Write)
    }

    /// Read and write over the whole subtree.
    pub fn read_writable_all(&self, node: NodeId, who: &Identity) -> bool {
        let state = self.state.lock();
        permissions::accessible_all(&state, node, who, AccessMode::Read)
            && permissions::accessible_all(&state, node, who, AccessMode::Write)
    }

    /// Ownership sweep after a re-owned copy: remove, bottom-up, every node
    /// under (and including) `node` that `who` cannot read, so a duplicate
    /// handed to a new owner never carries entries that owner could not see.
    pub fn prune_unreadable(&self, node: NodeId, who: &Identity) -> Result<()> {
        let mut state = self.state.lock();
        if !state.nodes.contains_key(&node) {
            return Err(FsError::NotFound);
        }
        self.prune(&mut state, node, who)?;
        debug!(%node, "unreadable entries pruned");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    fn duplicate(
        &self,
        state: &mut TreeState,
        source: NodeId,
        new_parent: NodeId,
        name: String,
        new_owner: Option<&OwnerSet>,
        now: f64,
        new_dirs: &mut Vec<NodeId>,
    ) -> Result<NodeId> {
        let src = state.nodes.get(&source).ok_or(FsError::NotFound)?;
        let owners = new_owner.cloned().unwrap_or_else(|| src.owners.clone());
        let perms = src.perms;
        let id = NodeId::generate();
        match &src.kind {
            NodeKind::File { content } => {
                let content = *content;
                self.store.add_reference(content)?;
                state.nodes.insert(
                    id,
                    Node {
                        id,
                        name: name.clone(),
                        owners,
                        perms,
                        created_at: now,
                        parent: Some(new_parent),
                        kind: NodeKind::File { content },
                    },
                );
            }
            NodeKind::Directory { children } => {
                let children: Vec<(String, NodeId)> =
                    children.iter().map(|(n, &c)| (n.clone(), c)).collect();
                state.nodes.insert(
                    id,
                    Node {
                        id,
                        name: name.clone(),
                        owners,
                        perms,
                        created_at: now,
                        parent: Some(new_parent),
                        kind: NodeKind::Directory {
                            children: HashMap::new(),
                        },
                    },
                );
                new_dirs.push(id);
                for (child_name, child) in children {
                    // Fresh empty directory: child names cannot conflict.
                    self.duplicate(state, child, id, child_name, new_owner, now, new_dirs)?;
                }
            }
        }
        state
            .nodes
            .get_mut(&new_parent)
            .and_then(Node::children_mut)
            .map(|c| c.insert(name, id));
        Ok(id)
    }

    /// Children first, then the node itself: a pruned directory may survive
    /// while some of its entries go, so each removal detaches and persists
    /// its own parent.
    fn prune(&self, state: &mut TreeState, id: NodeId, who: &Identity) -> Result<()> {
        let children: Vec<NodeId> = state
            .nodes
            .get(&id)
            .and_then(Node::children)
            .map(|c| c.values().copied().collect())
            .unwrap_or_default();
        for child in children {
            self.prune(state, child, who)?;
        }
        if permissions::accessible(state, id, who, AccessMode::Read) {
            return Ok(());
        }
        let Some(node) = state.nodes.get(&id) else {
            return Ok(());
        };
        let parent = node.parent;
        let name = node.name.clone();
        self.destroy(state, id)?;
        if let Some(parent) = parent {
            state
                .nodes
                .get_mut(&parent)
                .and_then(Node::children_mut)
                .map(|c| c.remove(&name));
            self.persist_dir(state, parent)?;
        }
        if state.root == id {
            self.make_root(state)?;
        }
        Ok(())
    }

    /// Bottom-up destruction of a subtree: children first, then the node.
    fn destroy(&self, state: &mut TreeState, id: NodeId) -> Result<()> {
        let Some(node) = state.nodes.get(&id) else {
            return Ok(());
        };
        match &node.kind {
            NodeKind::Directory { children } => {
                let children: Vec<NodeId> = children.values().copied().collect();
                for child in children {
                    self.destroy(state, child)?;
                }
                self.backend.execute(
                    "DELETE FROM file_system WHERE id = $1",
                    &[Value::Text(id.to_string())],
                )?;
            }
            NodeKind::File { content } => {
                self.store.release(*content)?;
            }
        }
        state.nodes.remove(&id);
        Ok(())
    }

    fn make_root(&self, state: &mut TreeState) -> Result<()> {
        let id = NodeId::generate();
        state.nodes.insert(
            id,
            Node {
                id,
                name: String::new(),
                owners: owner_set(&[SYSTEM_HANDLE]),
                perms: PermissionBits::default(),
                created_at: now_epoch(),
                parent: None,
                kind: NodeKind::Directory {
                    children: HashMap::new(),
                },
            },
        );
        state.root = id;
        self.persist_dir(state, id)?;
        debug!(root = %id, "root synthesized");
        Ok(())
    }

    /// Persist the rows for every mutated node: directories get their own
    /// row, files are carried by their parent's row.
    fn persist_subtree_rows(&self, state: &TreeState, ids: &[NodeId]) -> Result<()> {
        let mut dirs = BTreeSet::new();
        for &id in ids {
            match state.nodes.get(&id) {
                Some(n) if n.is_dir() => {
                    dirs.insert(id);
                }
                Some(n) => {
                    if let Some(parent) = n.parent {
                        dirs.insert(parent);
                    }
                }
                None => {}
            }
        }
        for dir in dirs {
            self.persist_dir(state, dir)?;
        }
        Ok(())
    }

    /// Upsert one directory row, with file children serialized inline.
    fn persist_dir(&self, state: &TreeState, id: NodeId) -> Result<()> {
        let Some(node) = state.nodes.get(&id) else {
            return Ok(());
        };
        let Some(children) = node.children() else {
            return Ok(());
        };

        let mut child_dirs: Vec<String> = Vec::new();
        let mut child_files: Vec<Vec<String>> = Vec::new();
        for child_id in children.values() {
            let Some(child) = state.nodes.get(child_id) else {
                continue;
            };
            match child.content() {
                None => child_dirs.push(child.id.to_string()),
                Some(content) => child_files.push(vec![
                    child.id.to_string(),
                    child.name.clone(),
                    join_owners(&child.owners),
                    child.perms.to_string(),
                    child.created_at.to_string(),
                    content.to_string(),
                ]),
            }
        }

        let id_param = Value::Text(id.to_string());
        let exists = !self
            .backend
            .execute("SELECT id FROM file_system WHERE id = $1", &[id_param.clone()])?
            .is_empty();
        let row = [
            Value::Text(node.name.clone()),
            Value::Text(join_owners(&node.owners)),
            Value::Text(node.perms.to_string()),
            Value::Real(node.created_at),
            Value::TextArray(child_dirs),
            Value::TextMatrix(child_files),
        ];
        if exists {
            let mut params: Vec<Value> = row.to_vec();
            params.push(id_param);
            self.backend.execute(
                "UPDATE file_system SET name = $1, owner = $2, permission_bits = $3, \
                 created_at = $4, child_dir_ids = $5, child_file_rows = $6 WHERE id = $7",
                &params,
            )?;
        } else {
            let mut params: Vec<Value> = vec![id_param];
            params.extend(row);
            self.backend.execute(
                "INSERT INTO file_system (id, name, owner, permission_bits, created_at, \
                 child_dir_ids, child_file_rows) VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &params,
            )?;
        }
        Ok(())
    }
}

/// Whether `node` lies inside the subtree rooted at `ancestor` (inclusive).
fn is_descendant(state: &TreeState, node: NodeId, ancestor: NodeId) -> bool {
    let mut cur = Some(node);
    let mut steps = state.nodes.len() + 1;
    while let Some(id) = cur {
        if id == ancestor {
            return true;
        }
        cur = state.nodes.get(&id).and_then(|n| n.parent);
        steps -= 1;
        if steps == 0 {
            return false;
        }
    }
    false
}

/// All ids in the subtree rooted at `node`, the root of the walk included.
fn collect_subtree(state: &TreeState, node: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut stack = vec![node];
    while let Some(id) = stack.pop() {
        let Some(n) = state.nodes.get(&id) else {
            continue;
        };
        out.push(id);
        if let Some(children) = n.children() {
            stack.extend(children.values().copied());
        }
    }
    out
}
