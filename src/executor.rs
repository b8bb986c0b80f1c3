// batch_ingestor/src/executor.rs
// Turns a batch into one bulk request and the response into per-item outcomes.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ConsistencyLevel;
use crate::error::{BatchError, Result, is_transient_message};
use crate::item::{
    Batch, BatchItem, BatchResult, FailureClass, ItemError, ItemKind, ItemOutcome, ItemResult,
};
use crate::transport::{RawResponse, Transport};

pub const OBJECTS_PATH: &str = "/v1/batch/objects";
pub const REFERENCES_PATH: &str = "/v1/batch/references";

/// Stateless sender for bulk-object and bulk-reference requests.
#[derive(Clone,)]
pub struct RequestExecutor {
    transport:         Arc<dyn Transport,>,
    consistency_level: Option<ConsistencyLevel,>,
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn Transport,>,) -> Self {
        Self {
            transport,
            consistency_level: None,
        }
    }

    pub fn with_consistency_level(mut self, level: Option<ConsistencyLevel,>,) -> Self {
        self.consistency_level = level;
        self
    }

    fn path_for(&self, kind: ItemKind,) -> String {
        let base = match kind {
            ItemKind::Object => OBJECTS_PATH,
            ItemKind::Reference => REFERENCES_PATH,
        };
        match self.consistency_level {
            Some(level,) => format!("{}?consistency_level={}", base, level.as_str()),
            None => base.to_string(),
        }
    }

    /// Request body in the server's bulk format, items in sequence order.
    pub fn request_body(batch: &Batch,) -> Value {
        let items: Vec<Value,> = batch.items().values().map(BatchItem::to_wire,).collect();
        match batch.kind() {
            ItemKind::Object => json!({ "objects": items }),
            ItemKind::Reference => Value::Array(items,),
        }
    }

    /// Performs exactly one network call for `batch`.
    pub async fn send(&self, batch: &Batch,) -> Result<RawResponse,> {
        let path = self.path_for(batch.kind(),);
        debug!("Sending {} items to {}", batch.len(), path);
        self.transport
            .post(&path, &Self::request_body(batch,),)
            .await
    }

    /// Sends `batch` once and classifies the response. `attempt` is recorded on each result.
    pub async fn execute(&self, batch: Batch, attempt: u32,) -> BatchResult {
        let response = self.send(&batch,).await;
        classify_response(&batch, response, attempt,)
    }
}

/// Maps a raw response (or transport failure) to one outcome per item in `batch`.
pub fn classify_response(
    batch: &Batch,
    response: Result<RawResponse,>,
    attempt: u32,
) -> BatchResult {
    let response = match response.and_then(RawResponse::error_for_status,) {
        Ok(r,) => r,
        Err(e,) => {
            warn!("Batch of {} items failed as a whole: {}", batch.len(), e);
            return BatchResult::uniform_error(batch, ItemError::from_batch_error(&e,), attempt,);
        },
    };

    let status = response.status;
    let entries = match response.json() {
        Some(Value::Array(entries,),) => entries,
        _ => {
            let err = BatchError::TransientTransport(format!(
                "undecodable batch response: {}",
                truncate(&response.text(), 200,)
            ),);
            warn!("{}", err);
            return BatchResult::uniform_error(batch, ItemError::from_batch_error(&err,), attempt,);
        },
    };

    let mut result = BatchResult::empty();
    for (index, (seq, item,),) in batch.items().iter().enumerate() {
        let outcome = match entries.get(index,) {
            Some(entry,) => classify_entry(entry, item, status,),
            None => ItemOutcome::Error(ItemError::new(
                "server returned no result for this item",
                Some(status,),
                FailureClass::Transient,
            ),),
        };
        result.insert(ItemResult {
            sequence: *seq,
            item: item.clone(),
            outcome,
            attempts: attempt,
        },);
    }
    result
}

fn classify_entry(entry: &Value, item: &BatchItem, status: u16,) -> ItemOutcome {
    if let Some(message,) = entry_error(entry,) {
        let class = if is_transient_message(&message,) {
            FailureClass::Transient
        } else {
            FailureClass::Validation
        };
        return ItemOutcome::Error(ItemError::new(message, Some(status,), class,),);
    }

    let id = entry
        .get("id",)
        .and_then(Value::as_str,)
        .and_then(|s| Uuid::parse_str(s,).ok(),)
        .or(match item {
            BatchItem::Object(o,) => o.id(),
            BatchItem::Reference(_,) => None,
        },);
    ItemOutcome::Success { id, }
}

/// Extracts the error text of a per-item result, if it reports one.
fn entry_error(entry: &Value,) -> Option<String,> {
    let result = entry.get("result",);

    let from_list = result
        .and_then(|r| r.pointer("/errors/error",),)
        .and_then(Value::as_array,)
        .map(|errors| {
            errors
                .iter()
                .filter_map(|e| e.get("message",).and_then(Value::as_str,),)
                .collect::<Vec<_,>>()
                .join("; ",)
        },)
        .filter(|m| !m.is_empty(),);
    if from_list.is_some() {
        return from_list;
    }

    if let Some(message,) = entry.pointer("/error/message",).and_then(Value::as_str,) {
        return Some(message.to_string(),);
    }

    let failed = result
        .and_then(|r| r.get("status",),)
        .and_then(Value::as_str,)
        .map(|s| s.eq_ignore_ascii_case("FAILED",),)
        .unwrap_or(false,);
    if failed {
        return Some("item reported FAILED without an error message".to_string(),);
    }
    None
}

fn truncate(text: &str, max: usize,) -> &str {
    match text.char_indices().nth(max,) {
        Some((idx, _,),) => &text[..idx],
        None => text,
    }
}
