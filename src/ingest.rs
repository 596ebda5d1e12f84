//! Change Ingestion
//!
//! The contract between a directory change listener and the cache, plus a
//! replay driver for change streams recorded as JSON lines:
//!
//! ```text
//! {"op": "create", "dn": "cn=g,dc=x", "new": {"objectClass": ["posixGroup"], ...}}
//! {"op": "modify", "dn": "cn=g2,dc=x", "old": {...}, "new": {...}, "old_dn": "cn=g,dc=x"}
//! {"op": "remove", "dn": "cn=g2,dc=x", "old": {...}}
//! ```
//!
//! Events must be presented in directory order; nothing here reorders or
//! coalesces them.

use std::io::BufRead;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::CacheEngine;
use crate::directory::{Attributes, DirectoryObject};
use crate::error::{Error, Result};

/// Receiver of directory change notifications
pub trait ChangeHandler {
    /// An entry was added
    fn on_create(&self, dn: &str, new: &Attributes) -> Result<()>;

    /// An entry changed; `old_dn` is set when it was also renamed
    fn on_modify(
        &self,
        dn: &str,
        old: &Attributes,
        new: &Attributes,
        old_dn: Option<&str>,
    ) -> Result<()>;

    /// An entry was deleted
    fn on_remove(&self, dn: &str, old: &Attributes) -> Result<()>;

    /// The listener finished a batch of notifications
    fn on_batch_end(&self) -> Result<()>;
}

impl ChangeHandler for CacheEngine {
    fn on_create(&self, dn: &str, new: &Attributes) -> Result<()> {
        self.dispatch_create(&DirectoryObject::with_attributes(dn, new.clone()))
    }

    fn on_modify(
        &self,
        dn: &str,
        old: &Attributes,
        new: &Attributes,
        old_dn: Option<&str>,
    ) -> Result<()> {
        let old = DirectoryObject::with_attributes(old_dn.unwrap_or(dn), old.clone());
        let new = DirectoryObject::with_attributes(dn, new.clone());
        self.dispatch_modify(&old, &new)
    }

    fn on_remove(&self, dn: &str, old: &Attributes) -> Result<()> {
        self.dispatch_remove(&DirectoryObject::with_attributes(dn, old.clone()))
    }

    fn on_batch_end(&self) -> Result<()> {
        self.cleanup().map(|_| ())
    }
}

/// One recorded directory change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ChangeEvent {
    Create {
        dn: String,
        new: Attributes,
    },
    Modify {
        dn: String,
        old: Attributes,
        new: Attributes,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        old_dn: Option<String>,
    },
    Remove {
        dn: String,
        old: Attributes,
    },
}

impl ChangeEvent {
    /// DN the event applies to
    pub fn dn(&self) -> &str {
        match self {
            ChangeEvent::Create { dn, .. }
            | ChangeEvent::Modify { dn, .. }
            | ChangeEvent::Remove { dn, .. } => dn,
        }
    }

    /// Deliver the event to `handler`
    pub fn apply<H: ChangeHandler + ?Sized>(&self, handler: &H) -> Result<()> {
        match self {
            ChangeEvent::Create { dn, new } => handler.on_create(dn, new),
            ChangeEvent::Modify {
                dn,
                old,
                new,
                old_dn,
            } => handler.on_modify(dn, old, new, old_dn.as_deref()),
            ChangeEvent::Remove { dn, old } => handler.on_remove(dn, old),
        }
    }
}

/// Outcome of [`replay`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    /// Events every interested shard accepted
    pub applied: usize,
    /// Events at least one shard rejected
    pub failed: usize,
}

/// Apply a JSON-lines change stream in order, then end the batch.
///
/// Blank lines and lines starting with `#` are ignored. A line that does not
/// decode aborts the replay with [`Error::MalformedEvent`]; events already
/// applied stay applied. Dispatch failures are logged and counted.
pub fn replay<H, R>(handler: &H, input: R) -> Result<ReplaySummary>
where
    H: ChangeHandler + ?Sized,
    R: BufRead,
{
    let mut summary = ReplaySummary::default();

    for (idx, line) in input.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let event: ChangeEvent =
            serde_json::from_str(trimmed).map_err(|e| Error::MalformedEvent {
                line: idx + 1,
                reason: e.to_string(),
            })?;

        match event.apply(handler) {
            Ok(()) => summary.applied += 1,
            Err(e @ Error::DispatchFailed { .. }) => {
                warn!(line = idx + 1, dn = %event.dn(), error = %e, "Change event not fully applied");
                summary.failed += 1;
            }
            Err(e) => return Err(e),
        }
        debug!(line = idx + 1, dn = %event.dn(), "Replayed change event");
    }

    handler.on_batch_end()?;
    info!(applied = summary.applied, failed = summary.failed, "Replay finished");
    Ok(summary)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;

    /// Records calls instead of applying them
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
    }

    impl ChangeHandler for Recorder {
        fn on_create(&self, dn: &str, _new: &Attributes) -> Result<()> {
            self.calls.lock().push(format!("create {}", dn));
            Ok(())
        }

        fn on_modify(
            &self,
            dn: &str,
            _old: &Attributes,
            _new: &Attributes,
            old_dn: Option<&str>,
        ) -> Result<()> {
            self.calls
                .lock()
                .push(format!("modify {} from {}", dn, old_dn.unwrap_or(dn)));
            Ok(())
        }

        fn on_remove(&self, dn: &str, _old: &Attributes) -> Result<()> {
            if dn == "cn=fail" {
                return Err(Error::DispatchFailed {
                    dn: dn.to_string(),
                    shards: vec!["x".to_string()],
                });
            }
            self.calls.lock().push(format!("remove {}", dn));
            Ok(())
        }

        fn on_batch_end(&self) -> Result<()> {
            self.calls.lock().push("batch end".to_string());
            Ok(())
        }
    }

    #[test]
    fn test_event_decoding() {
        let event: ChangeEvent = serde_json::from_str(
            r#"{"op": "modify", "dn": "cn=b", "old": {}, "new": {"cn": ["b"]}, "old_dn": "cn=a"}"#,
        )
        .unwrap();
        assert_matches!(&event, ChangeEvent::Modify { old_dn: Some(old), .. } if old == "cn=a");
        assert_eq!(event.dn(), "cn=b");

        let event: ChangeEvent =
            serde_json::from_str(r#"{"op": "modify", "dn": "cn=b", "old": {}, "new": {}}"#).unwrap();
        assert_matches!(event, ChangeEvent::Modify { old_dn: None, .. });
    }

    #[test]
    fn test_replay_in_order() {
        let input = r#"
# recorded by the listener
{"op": "create", "dn": "cn=a", "new": {}}
{"op": "modify", "dn": "cn=b", "old": {}, "new": {}, "old_dn": "cn=a"}

{"op": "remove", "dn": "cn=b", "old": {}}
{"op": "remove", "dn": "cn=fail", "old": {}}
"#;
        let recorder = Recorder::default();
        let summary = replay(&recorder, input.as_bytes()).unwrap();

        assert_eq!(summary, ReplaySummary { applied: 3, failed: 1 });
        assert_eq!(
            *recorder.calls.lock(),
            vec!["create cn=a", "modify cn=b from cn=a", "remove cn=b", "batch end"]
        );
    }

    #[test]
    fn test_malformed_line_reports_position() {
        let input = "{\"op\": \"create\", \"dn\": \"cn=a\", \"new\": {}}\n{\"op\": \"rename\"}\n";
        let recorder = Recorder::default();

        assert_matches!(
            replay(&recorder, input.as_bytes()),
            Err(Error::MalformedEvent { line: 2, .. })
        );
        assert_eq!(*recorder.calls.lock(), vec!["create cn=a"]);
    }
}
