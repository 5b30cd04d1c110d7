//! backend::record
//!
//! Values stored for each node.
//!
//! A node occupies two keys: the node record under
//! [`NODE_PREFIX`](crate::core::path::NODE_PREFIX), whose revisions give
//! `czxid`/`mzxid`, and the child record under
//! [`CHILD_META_PREFIX`](crate::core::path::CHILD_META_PREFIX), whose mod
//! revision gives `pzxid`. Keeping them apart means child churn never moves
//! a node's `mzxid`.

use serde::{Deserialize, Serialize};

use super::{KvEntry, KvError};
use crate::proto::{Acl, Stat};

/// Data and access metadata of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub version: i32,
    pub aversion: i32,
    pub acl: Vec<Acl>,
    pub ephemeral_owner: i64,
    pub ctime: i64,
    pub mtime: i64,
}

impl NodeRecord {
    pub fn new(data: Vec<u8>, acl: Vec<Acl>, ephemeral_owner: i64, now: i64) -> Self {
        Self {
            data,
            version: 0,
            aversion: 0,
            acl,
            ephemeral_owner,
            ctime: now,
            mtime: now,
        }
    }
}

/// Child bookkeeping of a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub cversion: i32,
    pub num_children: i32,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, KvError> {
    serde_json::to_vec(value).map_err(|e| KvError::Protocol(format!("encode record: {}", e)))
}

pub fn decode<T: for<'de> Deserialize<'de>>(entry: &KvEntry) -> Result<T, KvError> {
    serde_json::from_slice(&entry.value).map_err(|e| {
        KvError::Protocol(format!(
            "corrupt record at '{}': {}",
            String::from_utf8_lossy(&entry.key),
            e
        ))
    })
}

/// Build a stat from a node's two entries.
pub fn stat(node: &KvEntry, record: &NodeRecord, child: &KvEntry, children: &ChildRecord) -> Stat {
    Stat {
        czxid: node.create_revision,
        mzxid: node.mod_revision,
        ctime: record.ctime,
        mtime: record.mtime,
        version: record.version,
        cversion: children.cversion,
        aversion: record.aversion,
        ephemeral_owner: record.ephemeral_owner,
        data_length: record.data.len() as i32,
        num_children: children.num_children,
        pzxid: child.mod_revision,
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: Vec<u8>, create: i64, modified: i64) -> KvEntry {
        KvEntry {
            key: key.as_bytes().to_vec(),
            value,
            create_revision: create,
            mod_revision: modified,
        }
    }

    #[test]
    fn node_record_stores_data_as_base64() {
        let record = NodeRecord::new(vec![0, 255, 7], Acl::world_all(), 0, 10);
        let bytes = encode(&record).unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"AP8H\""));
        let back: NodeRecord = decode(&entry("k", bytes, 1, 1)).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn corrupt_record_is_a_protocol_error() {
        let err = decode::<ChildRecord>(&entry("k", b"{".to_vec(), 1, 1)).unwrap_err();
        assert!(matches!(err, KvError::Protocol(_)));
    }

    #[test]
    fn stat_takes_zxids_from_revisions() {
        let record = NodeRecord::new(b"abc".to_vec(), Acl::world_all(), 9, 100);
        let node = entry("n", vec![], 4, 6);
        let child = entry("c", vec![], 4, 8);
        let children = ChildRecord {
            cversion: 2,
            num_children: 1,
        };
        let stat = stat(&node, &record, &child, &children);
        assert_eq!(stat.czxid, 4);
        assert_eq!(stat.mzxid, 6);
        assert_eq!(stat.pzxid, 8);
        assert_eq!(stat.data_length, 3);
        assert_eq!(stat.ephemeral_owner, 9);
        assert_eq!(stat.cversion, 2);
    }
}
