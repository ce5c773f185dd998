//! Call ledger: lifecycle of every outbound model call
//!
//! The ledger is plain data. Illegal operations come back as errors; the
//! engine decides to log and ignore them. Closing a call classifies it and
//! hands back at most one feedback request for the coordinator.
//!
//! Host calls and the engine's own feedback calls live in separate lists,
//! each with its own cap, so feedback generation can never evict a host call
//! whose critique is still on its way.

use crate::config::LedgerConfig;
use serde_json::{json, Value};
use tracing::debug;
use worldloom_core::text::truncate_owned;
use worldloom_core::{now_millis, CallRecord, CallStatus, Error, Result, TaskKind};

/// A feedback task the ledger wants queued after closing a call.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedbackRequest {
    pub kind: TaskKind,
    pub payload: Value,
}

pub struct CallLedger {
    /// Host calls and external events.
    records: Vec<CallRecord>,
    /// Calls tagged with the internal prefix.
    internal: Vec<CallRecord>,
    config: LedgerConfig,
}

impl CallLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self::from_records(config, Vec::new())
    }

    pub fn from_records(config: LedgerConfig, records: Vec<CallRecord>) -> Self {
        let mut ledger = Self {
            records: Vec::new(),
            internal: Vec::new(),
            config,
        };
        ledger.replace_all(records);
        ledger
    }

    /// Open a call in the `running` state.
    pub fn initiate(&mut self, id: &str, call_type: &str, model: &str, prompt: &str) -> Result<()> {
        self.open(id, call_type, model, prompt, CallStatus::Running, now_millis())
    }

    /// Register a call that is waiting for a provider slot.
    pub fn enqueue(&mut self, id: &str, call_type: &str, model: &str, prompt: &str) -> Result<()> {
        self.open(id, call_type, model, prompt, CallStatus::Queued, now_millis())
    }

    pub(crate) fn open(
        &mut self,
        id: &str,
        call_type: &str,
        model: &str,
        prompt: &str,
        status: CallStatus,
        start_time: i64,
    ) -> Result<()> {
        if self.get(id).is_some() {
            return Err(Error::DuplicateCall(id.to_string()));
        }
        self.push(CallRecord {
            id: id.to_string(),
            prompt: truncate_owned(prompt, self.config.prompt_max_chars),
            response: None,
            status,
            start_time,
            end_time: None,
            duration: None,
            call_type: call_type.to_string(),
            model_used: model.to_string(),
            error: None,
            feedback: None,
            external: false,
        });
        Ok(())
    }

    /// Move a queued call to `running`.
    pub fn start(&mut self, id: &str) -> Result<()> {
        let record = self.get_mut(id)?;
        if record.status != CallStatus::Queued {
            return Err(Error::invalid_transition(id, record.status, "start"));
        }
        record.status = CallStatus::Running;
        record.start_time = now_millis();
        Ok(())
    }

    /// Close a running call with its response. Returns the feedback task the
    /// call should produce, if any.
    pub fn finalize(&mut self, id: &str, response: &str) -> Result<Option<FeedbackRequest>> {
        let max_chars = self.config.response_max_chars;
        let record = self.get_mut(id)?;
        if record.status != CallStatus::Running {
            return Err(Error::invalid_transition(id, record.status, "finalize"));
        }
        let end = now_millis();
        record.response = Some(truncate_owned(response, max_chars));
        record.status = CallStatus::Completed;
        record.end_time = Some(end);
        record.duration = Some((end - record.start_time).max(0));

        let request = self.classify(id);
        self.enforce_cap();
        Ok(request)
    }

    /// Close a queued or running call with an error.
    pub fn fail(&mut self, id: &str, error: &str) -> Result<()> {
        let max_chars = self.config.error_max_chars;
        let record = self.get_mut(id)?;
        if !record.status.is_open() {
            return Err(Error::invalid_transition(id, record.status, "fail"));
        }
        let end = now_millis();
        record.error = Some(truncate_owned(error, max_chars));
        record.status = CallStatus::Failed;
        record.end_time = Some(end);
        record.duration = Some((end - record.start_time).max(0));
        Ok(())
    }

    /// Insert an already-completed host event (e.g. "conversation cleared")
    /// and classify it like a finalized call.
    pub fn record_external(
        &mut self,
        id: &str,
        prompt: &str,
        response: &str,
        event_type: &str,
    ) -> Result<Option<FeedbackRequest>> {
        if self.get(id).is_some() {
            return Err(Error::DuplicateCall(id.to_string()));
        }
        let now = now_millis();
        self.push(CallRecord {
            id: id.to_string(),
            prompt: truncate_owned(prompt, self.config.prompt_max_chars),
            response: Some(truncate_owned(response, self.config.response_max_chars)),
            status: CallStatus::Completed,
            start_time: now,
            end_time: Some(now),
            duration: Some(0),
            call_type: event_type.to_string(),
            model_used: String::new(),
            error: None,
            feedback: None,
            external: true,
        });
        let request = self.classify(id);
        self.enforce_cap();
        Ok(request)
    }

    /// Store generated critique on a record. Returns false if the record was
    /// evicted in the meantime.
    pub fn attach_feedback(&mut self, id: &str, feedback: &str) -> bool {
        match self.get_mut(id) {
            Ok(record) => {
                record.feedback = Some(feedback.to_string());
                true
            }
            Err(_) => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&CallRecord> {
        self.records().find(|r| r.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut CallRecord> {
        self.records
            .iter_mut()
            .chain(self.internal.iter_mut())
            .find(|r| r.id == id)
            .ok_or_else(|| Error::UnknownCall(id.to_string()))
    }

    fn push(&mut self, record: CallRecord) {
        if self.is_internal(&record.call_type) {
            self.internal.push(record);
        } else {
            self.records.push(record);
        }
    }

    /// All records, newest first by start time.
    pub fn snapshot(&self) -> Vec<CallRecord> {
        let mut records: Vec<CallRecord> = self.records().cloned().collect();
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        records
    }

    /// Host records then internal ones, each in storage order. This is the
    /// persisted order.
    pub fn records(&self) -> impl Iterator<Item = &CallRecord> {
        self.records.iter().chain(self.internal.iter())
    }

    /// Host records (not external events) that have received critique.
    pub fn critiqued_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| !r.external && r.has_feedback())
            .count()
    }

    /// The `count` most recent completed records that carry feedback.
    pub fn recent_feedback(&self, count: usize) -> Vec<&CallRecord> {
        let mut done: Vec<&CallRecord> = self
            .records
            .iter()
            .filter(|r| r.status == CallStatus::Completed && r.has_feedback())
            .collect();
        done.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        done.truncate(count);
        done
    }

    pub fn len(&self) -> usize {
        self.records.len() + self.internal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.internal.clear();
    }

    pub fn replace_all(&mut self, records: Vec<CallRecord>) {
        self.clear();
        for record in records {
            self.push(record);
        }
    }

    /// Feedback-generation calls carry the reserved `<prefix>:` tag and are
    /// exempt from critique, which is what stops critique of critique.
    pub fn is_internal(&self, call_type: &str) -> bool {
        call_type
            .strip_prefix(self.config.internal_call_prefix.as_str())
            .is_some_and(|rest| rest.starts_with(':'))
    }

    /// Call type used when the engine ledgers its own generator calls.
    pub fn internal_call_type(&self, kind: &TaskKind) -> String {
        format!("{}:{}", self.config.internal_call_prefix, kind)
    }

    fn is_narrative(&self, record: &CallRecord) -> bool {
        let c = &self.config;
        c.narrative_call_types.iter().any(|t| *t == record.call_type)
            || c.narrative_id_prefixes.iter().any(|p| record.id.starts_with(p.as_str()))
            || c.narrative_prompt_markers.iter().any(|m| record.prompt.contains(m.as_str()))
    }

    fn classify(&self, id: &str) -> Option<FeedbackRequest> {
        let record = self.get(id)?;
        if self.is_internal(&record.call_type) {
            debug!("Call {} is internal ({}), no feedback", id, record.call_type);
            return None;
        }
        let kind = if self.is_narrative(record) {
            TaskKind::ChatTextFeedback
        } else {
            TaskKind::LlmCallFeedback
        };
        Some(FeedbackRequest {
            kind,
            payload: json!({
                "callId": record.id,
                "callType": record.call_type,
                "model": record.model_used,
                "prompt": record.prompt,
                "response": record.response,
                "external": record.external,
            }),
        })
    }

    fn enforce_cap(&mut self) {
        evict_oldest(&mut self.records, self.config.max_records, "host");
        evict_oldest(&mut self.internal, self.config.max_internal_records, "internal");
    }
}

fn evict_oldest(records: &mut Vec<CallRecord>, cap: usize, list: &str) {
    if records.len() <= cap {
        return;
    }
    // Stable: among equal start times the earlier-inserted record goes first.
    records.sort_by_key(|r| r.start_time);
    let excess = records.len() - cap;
    let evicted: Vec<String> = records.drain(..excess).map(|r| r.id).collect();
    debug!("Ledger evicted {} {} record(s): {:?}", evicted.len(), list, evicted);
}
