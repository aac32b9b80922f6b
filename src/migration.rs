//! The migration record and the set of migrations produced by a load.

use std::collections::HashSet;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::backend::BackendAdapter;
use crate::error::Error;
use crate::step::CollectedStepHandle;

/// Hex digest of `SHA-256(id)`, the key a migration is identified by in the
/// ledger. Deterministic: applying the same migration file twice (same
/// filename stem) always yields the same hash.
pub fn hash_id(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationKind {
    Normal,
    PostApplyHook,
}

/// One migration: an id, its hash, where it came from, and (once loaded)
/// the steps it runs.
pub struct Migration<B: BackendAdapter> {
    pub id: String,
    pub hash: String,
    pub path: PathBuf,
    pub source_group: String,
    pub depends: Vec<String>,
    pub steps: Vec<CollectedStepHandle<B>>,
    pub use_transactions: bool,
    pub kind: MigrationKind,
    /// The leading comment block from the migration's source, directive
    /// lines stripped. Empty for scripted migrations and files with no
    /// leading comment.
    pub doc: String,
}

impl<B: BackendAdapter> std::fmt::Debug for Migration<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migration").field("id", &self.id).finish()
    }
}

impl<B: BackendAdapter> PartialEq for Migration<B> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<B: BackendAdapter> Eq for Migration<B> {}

impl<B: BackendAdapter> std::hash::Hash for Migration<B> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl<B: BackendAdapter> PartialOrd for Migration<B> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<B: BackendAdapter> Ord for Migration<B> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.id.cmp(&other.id)
    }
}

impl<B: BackendAdapter> Migration<B> {
    pub fn new(
        id: impl Into<String>,
        path: impl Into<PathBuf>,
        source_group: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let hash = hash_id(&id);
        let kind = if id.starts_with("post-apply") {
            MigrationKind::PostApplyHook
        } else {
            MigrationKind::Normal
        };
        Migration {
            id,
            hash,
            path: path.into(),
            source_group: source_group.into(),
            depends: Vec::new(),
            steps: Vec::new(),
            use_transactions: true,
            kind,
            doc: String::new(),
        }
    }

    pub fn is_post_apply_hook(&self) -> bool {
        self.kind == MigrationKind::PostApplyHook
    }
}

/// An ordered collection of migrations plus their post-apply hooks,
/// produced by the loader and threaded through sort/ledger/engine.
///
/// Invariant: every id in `items` and `post_apply` is unique; `keys`
/// mirrors the ids present in `items` for O(1) conflict detection during
/// incremental loads.
pub struct MigrationSet<B: BackendAdapter> {
    pub items: Vec<Migration<B>>,
    pub post_apply: Vec<Migration<B>>,
    keys: HashSet<String>,
}

impl<B: BackendAdapter> MigrationSet<B> {
    pub fn new() -> Self {
        MigrationSet {
            items: Vec::new(),
            post_apply: Vec::new(),
            keys: HashSet::new(),
        }
    }

    pub fn insert(&mut self, migration: Migration<B>) -> Result<(), Error> {
        if self.keys.contains(&migration.id) {
            return Err(Error::MigrationConflict(migration.id.clone()));
        }
        self.keys.insert(migration.id.clone());
        match migration.kind {
            MigrationKind::Normal => self.items.push(migration),
            MigrationKind::PostApplyHook => self.post_apply.push(migration),
        }
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.keys.contains(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<B: BackendAdapter> Default for MigrationSet<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash_id("0001-create-users"), hash_id("0001-create-users"));
        assert_ne!(hash_id("0001-create-users"), hash_id("0002-add-index"));
    }

    #[test]
    fn hash_is_sha256_hex() {
        let h = hash_id("x");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn post_apply_prefix_selects_hook_kind() {
        let m = Migration::<crate::backend::sqlite::SqliteAdapter>::new(
            "post-apply-refresh-views",
            "/migrations/post-apply-refresh-views.sql",
            "default",
        );
        assert_eq!(m.kind, MigrationKind::PostApplyHook);
    }

    #[test]
    fn ordinary_id_is_normal_kind() {
        let m = Migration::<crate::backend::sqlite::SqliteAdapter>::new(
            "0001-create-users",
            "/migrations/0001-create-users.sql",
            "default",
        );
        assert_eq!(m.kind, MigrationKind::Normal);
    }
}
