//! Key layout of the LSM store.
//!
//! Every key starts with a one-byte tag followed by big-endian integers so
//! that lexicographic byte order equals numeric order and prefix scans stay
//! contiguous:
//!
//! - `N | node_id` → node record
//! - `A | node_id | user_id` → permission mask
//! - `E | from | to | relation_len u16 | relation | seq` → edge weight

use crate::{NodeId, UserId};

pub(crate) const NODE_TAG: u8 = b'N';
pub(crate) const ACL_TAG: u8 = b'A';
pub(crate) const EDGE_TAG: u8 = b'E';

pub(crate) fn node_key(id: NodeId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(NODE_TAG);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

pub(crate) fn node_prefix() -> Vec<u8> {
    vec![NODE_TAG]
}

pub(crate) fn decode_node_key(key: &[u8]) -> Option<NodeId> {
    if key.len() != 9 || key[0] != NODE_TAG {
        return None;
    }
    Some(u64::from_be_bytes(key[1..9].try_into().ok()?))
}

pub(crate) fn acl_key(node: NodeId, user: UserId) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(ACL_TAG);
    key.extend_from_slice(&node.to_be_bytes());
    key.extend_from_slice(&user.to_be_bytes());
    key
}

pub(crate) fn acl_prefix() -> Vec<u8> {
    vec![ACL_TAG]
}

pub(crate) fn decode_acl_key(key: &[u8]) -> Option<(NodeId, UserId)> {
    if key.len() != 17 || key[0] != ACL_TAG {
        return None;
    }
    let node = u64::from_be_bytes(key[1..9].try_into().ok()?);
    let user = u64::from_be_bytes(key[9..17].try_into().ok()?);
    Some((node, user))
}

/// Identity of one stored edge. `seq` is the sequence number of the
/// mutation that created it, which keeps repeated identical edges distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct EdgeKey {
    pub from: NodeId,
    pub to: NodeId,
    pub relation: String,
    pub seq: u64,
}

impl EdgeKey {
    pub(crate) fn encode(&self) -> Vec<u8> {
        let rel = self.relation.as_bytes();
        let mut key = Vec::with_capacity(1 + 8 + 8 + 2 + rel.len() + 8);
        key.push(EDGE_TAG);
        key.extend_from_slice(&self.from.to_be_bytes());
        key.extend_from_slice(&self.to.to_be_bytes());
        key.extend_from_slice(&(rel.len() as u16).to_be_bytes());
        key.extend_from_slice(rel);
        key.extend_from_slice(&self.seq.to_be_bytes());
        key
    }

    pub(crate) fn decode(key: &[u8]) -> Option<Self> {
        if key.len() < 1 + 8 + 8 + 2 + 8 || key[0] != EDGE_TAG {
            return None;
        }
        let from = u64::from_be_bytes(key[1..9].try_into().ok()?);
        let to = u64::from_be_bytes(key[9..17].try_into().ok()?);
        let rel_len = u16::from_be_bytes(key[17..19].try_into().ok()?) as usize;
        if key.len() != 19 + rel_len + 8 {
            return None;
        }
        let relation = std::str::from_utf8(&key[19..19 + rel_len]).ok()?.to_string();
        let seq = u64::from_be_bytes(key[19 + rel_len..].try_into().ok()?);
        Some(Self {
            from,
            to,
            relation,
            seq,
        })
    }
}

pub(crate) fn edge_prefix() -> Vec<u8> {
    vec![EDGE_TAG]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_keys_sort_numerically() {
        assert!(node_key(2) < node_key(10));
        assert!(node_key(255) < node_key(256));
        assert_eq!(decode_node_key(&node_key(42)), Some(42));
    }

    #[test]
    fn acl_key_decodes_both_ids() {
        let key = acl_key(7, 900);
        assert_eq!(decode_acl_key(&key), Some((7, 900)));
        assert!(key.starts_with(&acl_prefix()));
        assert_eq!(decode_acl_key(&node_key(7)), None);
    }

    #[test]
    fn edge_key_keeps_relation_and_seq() {
        let edge = EdgeKey {
            from: 1,
            to: 2,
            relation: "DEPENDS_ON".into(),
            seq: 99,
        };
        let decoded = EdgeKey::decode(&edge.encode()).unwrap();
        assert_eq!(decoded, edge);
    }

    #[test]
    fn edges_of_one_source_share_a_prefix() {
        let a = EdgeKey { from: 5, to: 1, relation: "x".into(), seq: 1 }.encode();
        let b = EdgeKey { from: 5, to: 9, relation: "y".into(), seq: 2 }.encode();
        let c = EdgeKey { from: 6, to: 0, relation: "x".into(), seq: 3 }.encode();
        assert!(a < b && b < c);
        assert_eq!(&a[..9], &b[..9]);
    }
}
