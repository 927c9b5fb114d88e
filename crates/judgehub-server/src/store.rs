//! Persistent store
//!
//! A key/value store of group_id -> group record. Each record is one JSON
//! file; writes go through an atomic temp-file + rename, and `put` fsyncs
//! before the rename. On startup every file is enumerated and fed to
//! recovery. Unknown keys inside the env survive through serde_json's Map.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use tokio::io::AsyncWriteExt;

use crate::env::GroupEnv;
use crate::error::StoreError;

/// Lifecycle state of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    ToJudge,
    Done,
}

/// One record in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: String,
    pub status: GroupStatus,
    /// Fractional unix seconds. Historical records encoded this as a
    /// string; both forms are readable.
    #[serde(deserialize_with = "de_timestamp")]
    pub timestamp: f64,
    pub retry_cnt: u32,
    pub env: GroupEnv,
}

fn de_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    struct TsVisitor;
    impl serde::de::Visitor<'_> for TsVisitor {
        type Value = f64;
        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("unix timestamp as number or string")
        }
        fn visit_f64<E: serde::de::Error>(self, v: f64) -> Result<f64, E> {
            Ok(v)
        }
        fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<f64, E> {
            Ok(v as f64)
        }
        fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<f64, E> {
            Ok(v as f64)
        }
        fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<f64, E> {
            v.parse().map_err(E::custom)
        }
    }
    d.deserialize_any(TsVisitor)
}

pub struct TaskStore {
    dir: PathBuf,
}

impl TaskStore {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Map a group_id to a safe file name (injective).
    fn file_name_for(id: &str) -> String {
        let mut out = String::with_capacity(id.len() + 8);
        for b in id.bytes() {
            match b {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-' | b'.' => {
                    out.push(b as char)
                }
                _ => out.push_str(&format!("%{b:02x}")),
            }
        }
        out.push_str(".json");
        out
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(Self::file_name_for(id))
    }

    /// Write a record. Fsyncs before the rename, so the record is durable
    /// once this returns.
    pub async fn put(&self, record: &GroupRecord) -> Result<(), StoreError> {
        let body = serde_json::to_vec(record)?;
        let path = self.path_for(&record.id);
        let tmp = path.with_extension("json.tmp");
        let mut f = tokio::fs::File::create(&tmp).await?;
        f.write_all(&body).await?;
        f.sync_all().await?;
        drop(f);
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Delete a record. A missing file is not an error (completion can race
    /// with loss handling).
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Enumerate every record. A corrupt record is unrecoverable, so it
    /// stops the load with an error.
    pub async fn load_all(&self) -> Result<Vec<GroupRecord>, StoreError> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let body = tokio::fs::read(&path).await?;
            let record: GroupRecord =
                serde_json::from_slice(&body).map_err(|source| StoreError::Corrupt {
                    path: path.display().to_string(),
                    source,
                })?;
            out.push(record);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> GroupRecord {
        GroupRecord {
            id: id.to_string(),
            status: GroupStatus::ToJudge,
            timestamp: 1491407526.72,
            retry_cnt: 0,
            env: serde_json::from_value(json!({
                "group_id": id,
                "workers_jobs": {
                    "t1": {"task_id": "t1", "group_id": id, "job_type": "compile"}
                }
            }))
            .unwrap(),
        }
    }

    #[tokio::test]
    async fn test_put_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).await.unwrap();
        store.put(&record("g1")).await.unwrap();
        store.put(&record("g2")).await.unwrap();

        let mut loaded = store.load_all().await.unwrap();
        loaded.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].id, "g1");
        assert_eq!(loaded[0].status, GroupStatus::ToJudge);

        store.delete("g1").await.unwrap();
        // double delete is fine
        store.delete("g1").await.unwrap();
        assert_eq!(store.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_put_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).await.unwrap();
        store.put(&record("g")).await.unwrap();
        let mut rec = record("g");
        rec.retry_cnt = 2;
        store.put(&rec).await.unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].retry_cnt, 2);
    }

    #[tokio::test]
    async fn test_hostile_group_id_stays_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).await.unwrap();
        store.put(&record("../weird/id с пробелом")).await.unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "../weird/id с пробелом");
    }

    #[tokio::test]
    async fn test_string_timestamp_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).await.unwrap();
        let raw = json!({
            "id": "old",
            "status": "to_judge",
            "timestamp": "1491407526.72",
            "retry_cnt": 0,
            "env": {"group_id": "old", "workers_jobs": {}}
        });
        tokio::fs::write(
            dir.path().join("old.json"),
            serde_json::to_vec(&raw).unwrap(),
        )
        .await
        .unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!((loaded[0].timestamp - 1491407526.72).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_unknown_env_keys_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path()).await.unwrap();
        let mut rec = record("g");
        rec.env = serde_json::from_value(json!({
            "group_id": "g",
            "workers_jobs": {},
            "future_extension": {"a": [1, 2, 3]}
        }))
        .unwrap();
        store.put(&rec).await.unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(
            loaded[0].env.as_map()["future_extension"],
            json!({"a": [1, 2, 3]})
        );
    }
}
