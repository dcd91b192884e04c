//! Per-node permission bitmaps.
//!
//! Every node owns three compressed bitmaps of user ids (read, write and
//! delete). Each node's bitmaps sit behind their own lock, so permission
//! changes on one node never contend with checks on another. The table is
//! a cache over the `A|…` rows of the LSM store.

use crate::{NodeId, UserId};
use parking_lot::RwLock;
use roaring::RoaringTreemap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Delete,
}

impl Permission {
    fn bit(self) -> u8 {
        match self {
            Permission::Read => 0b001,
            Permission::Write => 0b010,
            Permission::Delete => 0b100,
        }
    }
}

/// A set of permissions, stored on disk as a 3-bit mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub write: bool,
    #[serde(default)]
    pub delete: bool,
}

impl Permissions {
    pub const NONE: Permissions = Permissions {
        read: false,
        write: false,
        delete: false,
    };
    pub const ALL: Permissions = Permissions {
        read: true,
        write: true,
        delete: true,
    };
    pub const READ: Permissions = Permissions {
        read: true,
        write: false,
        delete: false,
    };

    pub fn from_mask(mask: u8) -> Self {
        Self {
            read: mask & Permission::Read.bit() != 0,
            write: mask & Permission::Write.bit() != 0,
            delete: mask & Permission::Delete.bit() != 0,
        }
    }

    pub fn mask(self) -> u8 {
        let mut m = 0;
        if self.read {
            m |= Permission::Read.bit();
        }
        if self.write {
            m |= Permission::Write.bit();
        }
        if self.delete {
            m |= Permission::Delete.bit();
        }
        m
    }

    pub fn contains(self, p: Permission) -> bool {
        self.mask() & p.bit() != 0
    }

    pub fn union(self, other: Permissions) -> Permissions {
        Self::from_mask(self.mask() | other.mask())
    }

    pub fn is_empty(self) -> bool {
        self.mask() == 0
    }
}

impl From<Permission> for Permissions {
    fn from(p: Permission) -> Self {
        Self::from_mask(p.bit())
    }
}

#[derive(Default)]
struct NodeAcl {
    read: RoaringTreemap,
    write: RoaringTreemap,
    delete: RoaringTreemap,
}

impl NodeAcl {
    fn bitmap(&self, p: Permission) -> &RoaringTreemap {
        match p {
            Permission::Read => &self.read,
            Permission::Write => &self.write,
            Permission::Delete => &self.delete,
        }
    }

    fn set(&mut self, user: UserId, perms: Permissions) {
        for (p, map) in [
            (perms.read, &mut self.read),
            (perms.write, &mut self.write),
            (perms.delete, &mut self.delete),
        ] {
            if p {
                map.insert(user);
            } else {
                map.remove(user);
            }
        }
    }

    fn get(&self, user: UserId) -> Permissions {
        Permissions {
            read: self.read.contains(user),
            write: self.write.contains(user),
            delete: self.delete.contains(user),
        }
    }

    fn users(&self) -> RoaringTreemap {
        &(&self.read | &self.write) | &self.delete
    }
}

#[derive(Default)]
pub struct AclStore {
    nodes: RwLock<HashMap<NodeId, Arc<RwLock<NodeAcl>>>>,
}

impl AclStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, node: NodeId) -> Option<Arc<RwLock<NodeAcl>>> {
        self.nodes.read().get(&node).cloned()
    }

    /// Replace the permission set of `user` on `node`.
    pub fn set(&self, node: NodeId, user: UserId, perms: Permissions) {
        let entry = match self.node(node) {
            Some(e) => e,
            None => Arc::clone(self.nodes.write().entry(node).or_default()),
        };
        entry.write().set(user, perms);
    }

    pub fn permissions(&self, node: NodeId, user: UserId) -> Permissions {
        self.node(node).map_or(Permissions::NONE, |acl| acl.read().get(user))
    }

    pub fn check(&self, node: NodeId, user: UserId, perm: Permission) -> bool {
        self.node(node)
            .is_some_and(|acl| acl.read().bitmap(perm).contains(user))
    }

    /// Every user holding at least one permission on `node`, ascending.
    pub fn users_of(&self, node: NodeId) -> Vec<UserId> {
        self.node(node)
            .map(|acl| acl.read().users().iter().collect())
            .unwrap_or_default()
    }

    /// Users allowed to read `node`.
    pub fn readers(&self, node: NodeId) -> RoaringTreemap {
        self.node(node)
            .map(|acl| acl.read().read.clone())
            .unwrap_or_default()
    }

    pub fn remove_node(&self, node: NodeId) {
        self.nodes.write().remove(&node);
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_conversion_is_lossless() {
        for mask in 0..8u8 {
            assert_eq!(Permissions::from_mask(mask).mask(), mask);
        }
        assert_eq!(Permissions::ALL.mask(), 0b111);
        assert!(Permissions::READ.contains(Permission::Read));
        assert!(!Permissions::READ.contains(Permission::Write));
    }

    #[test]
    fn set_replaces_previous_permissions() {
        let acl = AclStore::new();
        acl.set(1, 100, Permissions::ALL);
        acl.set(1, 200, Permissions::READ);
        assert!(acl.check(1, 100, Permission::Delete));
        assert!(acl.check(1, 200, Permission::Read));
        assert!(!acl.check(1, 200, Permission::Write));

        acl.set(1, 200, Permissions::NONE);
        assert!(!acl.check(1, 200, Permission::Read));
        assert_eq!(acl.users_of(1), vec![100]);
    }

    #[test]
    fn unknown_node_denies_everything() {
        let acl = AclStore::new();
        assert!(!acl.check(9, 1, Permission::Read));
        assert_eq!(acl.permissions(9, 1), Permissions::NONE);
        assert!(acl.readers(9).is_empty());
    }

    #[test]
    fn remove_node_drops_all_grants() {
        let acl = AclStore::new();
        acl.set(1, 100, Permissions::ALL);
        acl.remove_node(1);
        assert!(!acl.check(1, 100, Permission::Read));
        assert_eq!(acl.node_count(), 0);
    }

    #[test]
    fn large_user_ids_fit() {
        let acl = AclStore::new();
        acl.set(1, u64::MAX - 1, Permissions::READ);
        assert!(acl.check(1, u64::MAX - 1, Permission::Read));
        assert_eq!(acl.readers(1).len(), 1);
    }

    #[test]
    fn concurrent_grants_on_distinct_nodes() {
        let acl = Arc::new(AclStore::new());
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let acl = Arc::clone(&acl);
                std::thread::spawn(move || {
                    for user in 0..200u64 {
                        acl.set(t, user, Permissions::READ);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for t in 0..8u64 {
            assert_eq!(acl.readers(t).len(), 200);
        }
    }
}
