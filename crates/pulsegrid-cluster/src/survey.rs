//! Requester-side bookkeeping for in-flight surveys.
//!
//! Each survey gets an ID unique on this node and a channel that the
//! coordinator feeds with answers as they arrive. The waiting side stops at
//! the deadline or once every expected node answered, whichever is first.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use pulse_core::NodeId;

/// One node's answer to a survey.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SurveyReply {
    /// Zero means success; anything else is application-defined.
    pub code: u32,
    pub data: Vec<u8>,
}

impl SurveyReply {
    pub fn ok(data: Vec<u8>) -> Self {
        Self { code: 0, data }
    }
}

type ReplySender = mpsc::UnboundedSender<(NodeId, SurveyReply)>;

struct PendingSurvey {
    op: String,
    tx: ReplySender,
}

/// Table of surveys this node started and is still waiting on.
pub struct SurveyTable {
    next_id: AtomicU64,
    pending: RwLock<HashMap<u64, PendingSurvey>>,
}

impl Default for SurveyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SurveyTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Allocate an ID and register a pending entry for it.
    ///
    /// The entry is removed when the returned handle is dropped, so a
    /// cancelled survey never leaks.
    pub fn open(&self, op: &str) -> OpenSurvey<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.write().expect("survey table lock").insert(
            id,
            PendingSurvey {
                op: op.to_string(),
                tx: tx.clone(),
            },
        );
        OpenSurvey {
            table: self,
            id,
            tx,
            rx,
        }
    }

    /// Route an answer to the survey `id`.
    ///
    /// Returns `false` when no such survey is pending, which happens for
    /// answers that arrive after the deadline.
    pub fn deliver(&self, id: u64, from: &str, reply: SurveyReply) -> bool {
        let pending = self.pending.read().expect("survey table lock");
        match pending.get(&id) {
            Some(survey) => {
                debug!(survey_id = id, op = %survey.op, node_id = %from, "survey answer received");
                survey.tx.send((from.to_string(), reply)).is_ok()
            }
            None => false,
        }
    }

    /// Number of surveys still waiting for answers.
    pub fn len(&self) -> usize {
        self.pending.read().expect("survey table lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn close(&self, id: u64) {
        self.pending.write().expect("survey table lock").remove(&id);
    }
}

/// A survey registered in a [`SurveyTable`] and not yet collected.
pub struct OpenSurvey<'a> {
    table: &'a SurveyTable,
    id: u64,
    tx: ReplySender,
    rx: mpsc::UnboundedReceiver<(NodeId, SurveyReply)>,
}

impl OpenSurvey<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Sender for answers produced without going through the broker.
    pub fn local_sender(&self) -> ReplySender {
        self.tx.clone()
    }

    /// Wait for answers until every node in `expected` answered or
    /// `deadline` passes.
    ///
    /// Answers from nodes outside `expected` are kept but never extend the
    /// wait. When a node answers twice the first answer wins.
    pub async fn collect(
        mut self,
        mut expected: HashSet<NodeId>,
        deadline: Instant,
    ) -> HashMap<NodeId, SurveyReply> {
        let mut replies = HashMap::new();

        while !expected.is_empty() {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some((node_id, reply))) => {
                    expected.remove(&node_id);
                    replies.entry(node_id).or_insert(reply);
                }
                Ok(None) => break,
                Err(_) => {
                    debug!(survey_id = self.id, missing = expected.len(), "survey deadline reached");
                    break;
                }
            }
        }

        // Answers already queued when we stopped waiting still count.
        while let Ok((node_id, reply)) = self.rx.try_recv() {
            replies.entry(node_id).or_insert(reply);
        }

        replies
    }
}

impl Drop for OpenSurvey<'_> {
    fn drop(&mut self) {
        self.table.close(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn expect(ids: &[&str]) -> HashSet<NodeId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn ids_increase() {
        let table = SurveyTable::new();
        let first = table.open("stats").id();
        let second = table.open("stats").id();
        assert!(second > first);
    }

    #[test]
    fn unknown_id_is_rejected() {
        let table = SurveyTable::new();
        assert!(!table.deliver(42, "node-2", SurveyReply::ok(vec![])));
    }

    #[test]
    fn dropping_handle_closes_entry() {
        let table = SurveyTable::new();
        let survey = table.open("stats");
        let id = survey.id();
        assert_eq!(table.len(), 1);
        drop(survey);
        assert!(table.is_empty());
        assert!(!table.deliver(id, "node-2", SurveyReply::ok(vec![])));
    }

    #[tokio::test(start_paused = true)]
    async fn collect_returns_when_all_answered() {
        let table = SurveyTable::new();
        let survey = table.open("stats");
        let id = survey.id();

        assert!(table.deliver(id, "node-1", SurveyReply::ok(b"a".to_vec())));
        assert!(table.deliver(id, "node-2", SurveyReply::ok(b"b".to_vec())));

        let started = Instant::now();
        let replies = survey
            .collect(expect(&["node-1", "node-2"]), started + Duration::from_secs(10))
            .await;
        assert_eq!(replies.len(), 2);
        assert_eq!(replies["node-2"].data, b"b".to_vec());
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn collect_stops_at_deadline_with_partial_results() {
        let table = SurveyTable::new();
        let survey = table.open("stats");
        let id = survey.id();
        table.deliver(id, "node-1", SurveyReply::ok(vec![]));

        let started = Instant::now();
        let replies = survey
            .collect(expect(&["node-1", "node-2"]), started + Duration::from_millis(200))
            .await;
        assert_eq!(replies.len(), 1);
        assert!(replies.contains_key("node-1"));
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(!table.deliver(id, "node-2", SurveyReply::ok(vec![])));
    }

    #[tokio::test(start_paused = true)]
    async fn first_answer_wins() {
        let table = SurveyTable::new();
        let survey = table.open("stats");
        let id = survey.id();
        table.deliver(id, "node-2", SurveyReply { code: 0, data: b"first".to_vec() });
        table.deliver(id, "node-2", SurveyReply { code: 1, data: b"second".to_vec() });

        let replies = survey
            .collect(expect(&["node-2"]), Instant::now() + Duration::from_secs(1))
            .await;
        assert_eq!(replies["node-2"].data, b"first".to_vec());
        assert_eq!(replies["node-2"].code, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_joiner_is_kept_without_extending_wait() {
        let table = SurveyTable::new();
        let survey = table.open("stats");
        let id = survey.id();
        table.deliver(id, "node-9", SurveyReply::ok(vec![]));
        table.deliver(id, "node-1", SurveyReply::ok(vec![]));

        let replies = survey
            .collect(expect(&["node-1"]), Instant::now() + Duration::from_secs(1))
            .await;
        assert!(replies.contains_key("node-9"));
        assert!(replies.contains_key("node-1"));
    }
}
