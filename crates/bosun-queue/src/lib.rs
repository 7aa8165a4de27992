//! The durable plan queue.
//!
//! Every plan accepted off the bus is persisted under
//! `<storage>/plans/<timestamp>/plan.json` before it is acknowledged, and its
//! result is written to `result.json` in the same folder before it is
//! published. The folder is only removed once the result has been confirmed
//! sent, which gives the agent at-least-once semantics across crashes;
//! replayed plans are suppressed through the monotonic stamp persisted in
//! `<storage>/plans/stamp`.
//!
//! Folder names are decimal timestamps in 100 microsecond units, so the
//! lexicographically smallest folder is also the oldest.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use bosun_sign::SignatureVerifier;
use bosun_types::{ExecutionPlan, ExecutionResult};

const PLAN_FILE: &str = "plan.json";
const RESULT_FILE: &str = "result.json";
const STAMP_FILE: &str = "stamp";

/// The envelope written to `plan.json`.
#[derive(Debug, Serialize, Deserialize)]
struct PlanRecord {
    /// Base64 of the raw plan bytes as delivered on the wire.
    #[serde(rename = "Data")]
    data: String,
    /// Base64 of the message signature; empty when the message was unsigned.
    #[serde(rename = "Signature")]
    signature: String,
    #[serde(rename = "ID")]
    id: Option<String>,
    #[serde(rename = "ReplyTo")]
    reply_to: Option<String>,
}

/// A plan pulled off the queue together with the folder it lives in.
#[derive(Debug, Clone)]
pub struct QueuedPlan {
    pub plan: ExecutionPlan,
    /// Folder name; hand back to [`PlanQueue::remove`] once the result is out.
    pub timestamp: String,
}

/// FS-backed FIFO of pending plans and pending results.
pub struct PlanQueue {
    plans_dir: PathBuf,
    verifier: Option<SignatureVerifier>,
    last_stamp: i64,
}

impl PlanQueue {
    /// Open (or create) the queue under `<storage>/plans/`.
    ///
    /// The directory is created mode 0700 and the mode is re-applied on
    /// every startup. When `verifier` is present, every plan peeked off the
    /// queue must carry a valid signature.
    pub fn open(storage: &Path, verifier: Option<SignatureVerifier>) -> Result<Self> {
        let plans_dir = storage.join("plans");
        std::fs::create_dir_all(&plans_dir)
            .with_context(|| format!("failed to create plan store {}", plans_dir.display()))?;
        restrict_permissions(&plans_dir);

        let last_stamp = load_stamp(&plans_dir.join(STAMP_FILE))?;
        Ok(Self {
            plans_dir,
            verifier,
            last_stamp,
        })
    }

    /// Persist an incoming plan. Returns the folder timestamp.
    pub fn put(
        &self,
        plan_bytes: &[u8],
        signature: Option<&[u8]>,
        msg_id: &str,
        reply_to: Option<&str>,
    ) -> Result<String> {
        let record = PlanRecord {
            data: bosun_codec::b64encode(plan_bytes),
            signature: bosun_codec::b64encode(signature.unwrap_or_default()),
            id: Some(msg_id.to_string()),
            reply_to: reply_to.map(str::to_string),
        };

        let mut timestamp = now_timestamp();
        let folder = loop {
            let candidate = self.plans_dir.join(timestamp.to_string());
            match std::fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    // Two puts inside the same 100 microsecond tick.
                    timestamp += 1;
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("failed to create plan folder {}", candidate.display())
                    });
                }
            }
        };

        let payload = serde_json::to_string(&record).context("failed to encode plan record")?;
        std::fs::write(folder.join(PLAN_FILE), payload)
            .with_context(|| format!("failed to write plan record in {}", folder.display()))?;

        debug!(timestamp = %timestamp, msg_id, "persisted execution plan");
        Ok(timestamp.to_string())
    }

    /// The oldest pending plan, if any.
    ///
    /// Records that fail decoding, signature verification, the stamp check,
    /// or JSON parsing are dropped (their folder removed) and the next
    /// candidate is tried; only store-level I/O failures propagate.
    pub fn peek_plan(&mut self) -> Result<Option<QueuedPlan>> {
        loop {
            let Some(timestamp) = self.first_timestamp(PLAN_FILE)? else {
                return Ok(None);
            };

            match self.load_plan(&timestamp) {
                Ok(plan) => {
                    return Ok(Some(QueuedPlan { plan, timestamp }));
                }
                Err(e) => {
                    warn!(timestamp = %timestamp, error = %format!("{e:#}"), "dropping unusable plan record");
                    self.remove(&timestamp)?;
                }
            }
        }
    }

    fn load_plan(&mut self, timestamp: &str) -> Result<ExecutionPlan> {
        let path = self.plans_dir.join(timestamp).join(PLAN_FILE);
        let record: PlanRecord = serde_json::from_slice(
            &std::fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?,
        )
        .context("plan record is not valid JSON")?;

        let data = bosun_codec::b64decode_bytes(&record.data)?;
        if let Some(verifier) = &self.verifier {
            let signature = bosun_codec::b64decode_bytes(&record.signature)?;
            verifier.verify(&data, &signature)?;
        }

        let doc: Value = serde_json::from_slice(&data).context("plan payload is not JSON")?;
        if !doc.is_object() {
            bail!("message is not a document");
        }

        let stamp = doc.get("Stamp").and_then(Value::as_i64).unwrap_or(-1);
        if stamp >= 0 {
            if stamp <= self.last_stamp {
                bail!("dropping old or duplicate message (stamp {stamp})");
            }
            self.save_stamp(stamp)?;
        }

        let mut plan: ExecutionPlan =
            serde_json::from_value(doc).context("plan document has an invalid shape")?;
        if plan.id.is_none() {
            plan.id = record.id;
        }
        if plan.reply_to.is_none() {
            plan.reply_to = record.reply_to;
        }
        Ok(plan)
    }

    /// Persist a result next to the plan it answers. The plan's `ReplyTo` is
    /// copied onto the envelope so the pump can honour dynamic routing after
    /// a restart.
    pub fn put_result(&self, result: &ExecutionResult, plan: &QueuedPlan) -> Result<()> {
        let mut result = result.clone();
        if plan.plan.reply_to.is_some() {
            result.reply_to = plan.plan.reply_to.clone();
        }

        let path = self.plans_dir.join(&plan.timestamp).join(RESULT_FILE);
        let payload = serde_json::to_string(&result).context("failed to encode result")?;
        std::fs::write(&path, payload)
            .with_context(|| format!("failed to write result in {}", path.display()))?;
        debug!(timestamp = %plan.timestamp, "persisted execution result");
        Ok(())
    }

    /// The oldest pending result, if any, with its folder timestamp.
    pub fn peek_result(&self) -> Result<Option<(Value, String)>> {
        let Some(timestamp) = self.first_timestamp(RESULT_FILE)? else {
            return Ok(None);
        };
        let path = self.plans_dir.join(&timestamp).join(RESULT_FILE);
        let result = serde_json::from_slice(
            &std::fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?,
        )
        .context("result record is not valid JSON")?;
        Ok(Some((result, timestamp)))
    }

    /// Drop one plan folder, result included.
    pub fn remove(&self, timestamp: &str) -> Result<()> {
        let path = self.plans_dir.join(timestamp);
        std::fs::remove_dir_all(&path)
            .with_context(|| format!("failed to remove plan folder {}", path.display()))
    }

    /// The highest stamp accepted so far (0 before any stamped plan).
    pub fn last_stamp(&self) -> i64 {
        self.last_stamp
    }

    /// Oldest folder containing `filename`, by lexicographic (= insertion)
    /// order.
    fn first_timestamp(&self, filename: &str) -> Result<Option<String>> {
        let mut timestamps: Vec<String> = std::fs::read_dir(&self.plans_dir)
            .with_context(|| format!("failed to list {}", self.plans_dir.display()))?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(filename).exists())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        timestamps.sort();
        Ok(timestamps.into_iter().next())
    }

    fn save_stamp(&mut self, stamp: i64) -> Result<()> {
        let path = self.plans_dir.join(STAMP_FILE);
        let tmp_path = self.plans_dir.join(".stamp.tmp");
        std::fs::write(&tmp_path, stamp.to_string())
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename stamp into {}", path.display()))?;
        self.last_stamp = stamp;
        Ok(())
    }
}

fn now_timestamp() -> u128 {
    // 100 microsecond units since the epoch; equal-width decimal names keep
    // lexicographic order equal to insertion order.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_micros()
        / 100
}

fn load_stamp(path: &Path) -> Result<i64> {
    if !path.exists() {
        return Ok(0);
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    contents
        .trim()
        .parse()
        .with_context(|| format!("stamp file {} is not an integer", path.display()))
}

#[cfg(unix)]
fn restrict_permissions(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700));
}

#[cfg(not(unix))]
fn restrict_permissions(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use rsa::{Pkcs1v15Sign, RsaPrivateKey};
    use serde_json::json;
    use sha2::{Digest, Sha256};
    use tempfile::tempdir;

    fn plan_bytes(id: &str, stamp: Option<i64>) -> Vec<u8> {
        let mut doc = json!({
            "FormatVersion": "2.0.0",
            "ID": id,
            "Scripts": {},
            "Files": {},
        });
        if let Some(stamp) = stamp {
            doc["Stamp"] = json!(stamp);
        }
        doc.to_string().into_bytes()
    }

    #[test]
    fn put_then_peek_roundtrips() {
        let storage = tempdir().expect("tempdir");
        let mut queue = PlanQueue::open(storage.path(), None).expect("open");

        queue
            .put(&plan_bytes("P1", None), None, "M1", Some("reply-key"))
            .expect("put");

        let queued = queue.peek_plan().expect("peek").expect("plan present");
        assert_eq!(queued.plan.id.as_deref(), Some("P1"));
        assert_eq!(queued.plan.reply_to.as_deref(), Some("reply-key"));
    }

    #[test]
    fn envelope_fills_missing_plan_id() {
        let storage = tempdir().expect("tempdir");
        let mut queue = PlanQueue::open(storage.path(), None).expect("open");

        let doc = json!({"Scripts": {}, "Files": {}}).to_string();
        queue
            .put(doc.as_bytes(), None, "from-message", None)
            .expect("put");

        let queued = queue.peek_plan().expect("peek").expect("plan present");
        assert_eq!(queued.plan.id.as_deref(), Some("from-message"));
    }

    #[test]
    fn fifo_order() {
        let storage = tempdir().expect("tempdir");
        let mut queue = PlanQueue::open(storage.path(), None).expect("open");

        let first = queue.put(&plan_bytes("P1", None), None, "M1", None).expect("put");
        let second = queue.put(&plan_bytes("P2", None), None, "M2", None).expect("put");
        assert!(first < second);

        let queued = queue.peek_plan().expect("peek").expect("plan present");
        assert_eq!(queued.plan.id.as_deref(), Some("P1"));
        assert_eq!(queued.timestamp, first);
    }

    #[test]
    fn duplicate_stamp_is_dropped() {
        let storage = tempdir().expect("tempdir");
        let mut queue = PlanQueue::open(storage.path(), None).expect("open");

        queue.put(&plan_bytes("P1", Some(5)), None, "M1", None).expect("put");
        let first = queue.peek_plan().expect("peek").expect("plan present");
        queue.remove(&first.timestamp).expect("remove");

        queue.put(&plan_bytes("P2", Some(5)), None, "M2", None).expect("put");
        assert!(queue.peek_plan().expect("peek").is_none());
        // The duplicate's folder is gone too.
        assert!(queue.peek_result().expect("peek result").is_none());
    }

    #[test]
    fn stamp_survives_reopen() {
        let storage = tempdir().expect("tempdir");
        {
            let mut queue = PlanQueue::open(storage.path(), None).expect("open");
            queue.put(&plan_bytes("P1", Some(7)), None, "M1", None).expect("put");
            queue.peek_plan().expect("peek").expect("plan present");
            assert_eq!(queue.last_stamp(), 7);
        }

        let queue = PlanQueue::open(storage.path(), None).expect("reopen");
        assert_eq!(queue.last_stamp(), 7);
    }

    #[test]
    fn unsigned_plan_is_dropped_when_key_configured() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).expect("generate key");
        let pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("pem");
        let verifier = SignatureVerifier::from_pem(&pem, "input-q").expect("verifier");

        let storage = tempdir().expect("tempdir");
        let mut queue = PlanQueue::open(storage.path(), Some(verifier)).expect("open");

        let folder = queue.put(&plan_bytes("P1", None), None, "M1", None).expect("put");
        assert!(queue.peek_plan().expect("peek").is_none());
        assert!(!storage.path().join("plans").join(folder).exists());
    }

    #[test]
    fn signed_plan_is_accepted() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).expect("generate key");
        let pem = private
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("pem");
        let verifier = SignatureVerifier::from_pem(&pem, "input-q").expect("verifier");

        let bytes = plan_bytes("P1", None);
        let mut hasher = Sha256::new();
        hasher.update(b"input-q");
        hasher.update(&bytes);
        let signature = private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &hasher.finalize())
            .expect("sign");

        let storage = tempdir().expect("tempdir");
        let mut queue = PlanQueue::open(storage.path(), Some(verifier)).expect("open");
        queue.put(&bytes, Some(&signature), "M1", None).expect("put");

        let queued = queue.peek_plan().expect("peek").expect("plan present");
        assert_eq!(queued.plan.id.as_deref(), Some("P1"));
    }

    #[test]
    fn garbage_record_is_dropped_and_next_served() {
        let storage = tempdir().expect("tempdir");
        let mut queue = PlanQueue::open(storage.path(), None).expect("open");

        // Hand-craft an older folder with an unparseable record.
        let bad = storage.path().join("plans").join("1000000000000000");
        std::fs::create_dir_all(&bad).expect("mkdir");
        std::fs::write(bad.join("plan.json"), b"not json").expect("write");

        queue.put(&plan_bytes("P2", None), None, "M2", None).expect("put");

        let queued = queue.peek_plan().expect("peek").expect("plan present");
        assert_eq!(queued.plan.id.as_deref(), Some("P2"));
        assert!(!bad.exists());
    }

    #[test]
    fn result_roundtrip_and_remove() {
        let storage = tempdir().expect("tempdir");
        let mut queue = PlanQueue::open(storage.path(), None).expect("open");

        let doc = json!({
            "FormatVersion": "2.0.0",
            "ID": "P1",
            "ReplyTo": "dyn-key",
            "Scripts": {},
            "Files": {},
        })
        .to_string();
        queue.put(doc.as_bytes(), None, "M1", None).expect("put");
        let queued = queue.peek_plan().expect("peek").expect("plan present");

        let envelope =
            ExecutionResult::from_result(json!("hi"), queued.plan.id.as_deref()).expect("envelope");
        queue.put_result(&envelope, &queued).expect("put result");

        let (stored, timestamp) = queue.peek_result().expect("peek result").expect("present");
        assert_eq!(stored["SourceID"], "P1");
        // ReplyTo copied from the plan for dynamic routing after restart.
        assert_eq!(stored["ReplyTo"], "dyn-key");
        assert_eq!(timestamp, queued.timestamp);

        queue.remove(&timestamp).expect("remove");
        assert!(queue.peek_result().expect("peek result").is_none());
        assert!(!storage.path().join("plans").join(&timestamp).exists());
    }

    #[test]
    fn pending_records_survive_reopen() {
        let storage = tempdir().expect("tempdir");
        {
            let queue = PlanQueue::open(storage.path(), None).expect("open");
            queue.put(&plan_bytes("P1", None), None, "M1", None).expect("put");
        }

        let mut queue = PlanQueue::open(storage.path(), None).expect("reopen");
        let queued = queue.peek_plan().expect("peek").expect("plan survived restart");
        assert_eq!(queued.plan.id.as_deref(), Some("P1"));
    }
}
