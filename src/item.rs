// batch_ingestor/src/item.rs
// Value types for pending writes and their outcomes.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value, json};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{BatchError, Result};

/// Host part used in reference beacons. The server resolves it locally.
const BEACON_PREFIX: &str = "weaviate://localhost";

/// Upper-cases the first character of a collection name, the form the server stores.
pub fn normalize_collection_name(name: &str,) -> Result<String,> {
    let trimmed = name.trim();
    let mut chars = trimmed.chars();
    match chars.next() {
        None => Err(BatchError::Validation("collection name must not be empty".to_string(),),),
        Some(first,) => Ok(first.to_uppercase().chain(chars,).collect(),),
    }
}

fn parse_uuid(raw: &str, field: &str,) -> Result<Uuid,> {
    Uuid::parse_str(raw,)
        .map_err(|e| BatchError::Validation(format!("{} '{}' is not a valid UUID: {}", field, raw, e),),)
}

fn non_empty_tenant(tenant: Option<String,>,) -> Result<Option<String,>,> {
    match tenant {
        Some(t,) if t.trim().is_empty() => {
            Err(BatchError::Validation("tenant must not be empty when set".to_string(),),)
        },
        other => Ok(other,),
    }
}

/// A pending object write.
#[derive(Debug, Clone, PartialEq,)]
pub struct ObjectItem {
    collection:    String,
    id:            Option<Uuid,>,
    properties:    Map<String, Value,>,
    vector:        Option<Vec<f32,>,>,
    named_vectors: HashMap<String, Vec<f32,>,>,
    tenant:        Option<String,>,
}

impl ObjectItem {
    /// Creates an object for `collection` with the given properties.
    ///
    /// `properties` must be a JSON object (or `null` for no properties).
    pub fn new(collection: &str, properties: Value,) -> Result<Self,> {
        let properties = match properties {
            Value::Object(map,) => map,
            Value::Null => Map::new(),
            other => {
                return Err(BatchError::Validation(format!(
                    "properties must be a JSON object, got {}",
                    other
                ),),);
            },
        };

        Ok(Self {
            collection: normalize_collection_name(collection,)?,
            id: None,
            properties,
            vector: None,
            named_vectors: HashMap::new(),
            tenant: None,
        },)
    }

    pub fn with_id(mut self, id: Uuid,) -> Self {
        self.id = Some(id,);
        self
    }

    /// Parses and sets the object id.
    pub fn with_id_str(self, id: &str,) -> Result<Self,> {
        let id = parse_uuid(id, "object id",)?;
        Ok(self.with_id(id,),)
    }

    /// Assigns a random id so results can be matched back without relying on the server.
    pub fn with_generated_id(self,) -> Self {
        self.with_id(Uuid::new_v4(),)
    }

    pub fn with_vector(mut self, vector: Vec<f32,>,) -> Result<Self,> {
        if vector.is_empty() {
            return Err(BatchError::Validation("vector must not be empty".to_string(),),);
        }
        self.vector = Some(vector,);
        Ok(self,)
    }

    pub fn with_named_vector(mut self, name: &str, vector: Vec<f32,>,) -> Result<Self,> {
        if name.trim().is_empty() {
            return Err(BatchError::Validation("vector name must not be empty".to_string(),),);
        }
        if vector.is_empty() {
            return Err(BatchError::Validation(format!("named vector '{}' is empty", name),),);
        }
        self.named_vectors.insert(name.to_string(), vector,);
        Ok(self,)
    }

    pub fn with_tenant(mut self, tenant: impl Into<String,>,) -> Result<Self,> {
        self.tenant = non_empty_tenant(Some(tenant.into(),),)?;
        Ok(self,)
    }

    pub fn collection(&self,) -> &str {
        &self.collection
    }

    pub fn id(&self,) -> Option<Uuid,> {
        self.id
    }

    pub fn properties(&self,) -> &Map<String, Value,> {
        &self.properties
    }

    pub fn tenant(&self,) -> Option<&str,> {
        self.tenant.as_deref()
    }

    /// Wire form of the object inside a bulk-object request.
    pub fn to_wire(&self,) -> Value {
        let mut obj = Map::new();
        obj.insert("class".to_string(), Value::String(self.collection.clone(),),);
        obj.insert("properties".to_string(), Value::Object(self.properties.clone(),),);
        if let Some(id,) = self.id {
            obj.insert("id".to_string(), Value::String(id.to_string(),),);
        }
        if let Some(vector,) = &self.vector {
            obj.insert("vector".to_string(), json!(vector),);
        }
        if !self.named_vectors.is_empty() {
            obj.insert("vectors".to_string(), json!(self.named_vectors),);
        }
        if let Some(tenant,) = &self.tenant {
            obj.insert("tenant".to_string(), Value::String(tenant.clone(),),);
        }
        Value::Object(obj,)
    }
}

/// A pending cross-reference write from one object property to another object.
#[derive(Debug, Clone, PartialEq, Eq,)]
pub struct ReferenceItem {
    from_collection: String,
    from_id:         Uuid,
    from_property:   String,
    to_collection:   String,
    to_id:           Uuid,
    tenant:          Option<String,>,
}

impl ReferenceItem {
    pub fn new(
        from_collection: &str,
        from_id: &str,
        from_property: &str,
        to_collection: &str,
        to_id: &str,
    ) -> Result<Self,> {
        if from_property.trim().is_empty() {
            return Err(BatchError::Validation("reference property must not be empty".to_string(),),);
        }

        Ok(Self {
            from_collection: normalize_collection_name(from_collection,)?,
            from_id:         parse_uuid(from_id, "from id",)?,
            from_property:   from_property.to_string(),
            to_collection:   normalize_collection_name(to_collection,)?,
            to_id:           parse_uuid(to_id, "to id",)?,
            tenant:          None,
        },)
    }

    pub fn with_tenant(mut self, tenant: impl Into<String,>,) -> Result<Self,> {
        self.tenant = non_empty_tenant(Some(tenant.into(),),)?;
        Ok(self,)
    }

    pub fn from_collection(&self,) -> &str {
        &self.from_collection
    }

    pub fn from_id(&self,) -> Uuid {
        self.from_id
    }

    pub fn to_id(&self,) -> Uuid {
        self.to_id
    }

    pub fn tenant(&self,) -> Option<&str,> {
        self.tenant.as_deref()
    }

    pub fn from_beacon(&self,) -> String {
        format!(
            "{}/{}/{}/{}",
            BEACON_PREFIX, self.from_collection, self.from_id, self.from_property
        )
    }

    pub fn to_beacon(&self,) -> String {
        format!("{}/{}/{}", BEACON_PREFIX, self.to_collection, self.to_id)
    }

    /// Wire form of the reference inside a bulk-reference request.
    pub fn to_wire(&self,) -> Value {
        let mut obj = Map::new();
        obj.insert("from".to_string(), Value::String(self.from_beacon(),),);
        obj.insert("to".to_string(), Value::String(self.to_beacon(),),);
        if let Some(tenant,) = &self.tenant {
            obj.insert("tenant".to_string(), Value::String(tenant.clone(),),);
        }
        Value::Object(obj,)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash,)]
pub enum ItemKind {
    Object,
    Reference,
}

#[derive(Debug, Clone, PartialEq,)]
pub enum BatchItem {
    Object(ObjectItem,),
    Reference(ReferenceItem,),
}

impl BatchItem {
    pub fn kind(&self,) -> ItemKind {
        match self {
            BatchItem::Object(_,) => ItemKind::Object,
            BatchItem::Reference(_,) => ItemKind::Reference,
        }
    }

    pub fn collection(&self,) -> &str {
        match self {
            BatchItem::Object(o,) => o.collection(),
            BatchItem::Reference(r,) => r.from_collection(),
        }
    }

    pub fn to_wire(&self,) -> Value {
        match self {
            BatchItem::Object(o,) => o.to_wire(),
            BatchItem::Reference(r,) => r.to_wire(),
        }
    }
}

impl From<ObjectItem,> for BatchItem {
    fn from(item: ObjectItem,) -> Self {
        BatchItem::Object(item,)
    }
}

impl From<ReferenceItem,> for BatchItem {
    fn from(item: ReferenceItem,) -> Self {
        BatchItem::Reference(item,)
    }
}

/// A bounded, homogeneous group of items keyed by their queue sequence number.
#[derive(Debug, Clone,)]
pub struct Batch {
    kind:       ItemKind,
    items:      BTreeMap<u64, BatchItem,>,
    created_at: Instant,
}

impl Batch {
    pub fn new(items: BTreeMap<u64, BatchItem,>, max_batch_size: usize,) -> Result<Self,> {
        let kind = Self::check(&items, max_batch_size,)?;
        Ok(Self::from_checked(kind, items,),)
    }

    /// Validates `items` as a batch without taking them: non-empty, bounded and homogeneous.
    pub fn check(items: &BTreeMap<u64, BatchItem,>, max_batch_size: usize,) -> Result<ItemKind,> {
        let kind = match items.values().next() {
            Some(first,) => first.kind(),
            None => return Err(BatchError::Validation("a batch must not be empty".to_string(),),),
        };
        if items.len() > max_batch_size {
            return Err(BatchError::Validation(format!(
                "batch of {} items exceeds the maximum of {}",
                items.len(),
                max_batch_size
            ),),);
        }
        if items.values().any(|i| i.kind() != kind,) {
            return Err(BatchError::Validation(
                "objects and references cannot share a batch".to_string(),
            ),);
        }
        Ok(kind,)
    }

    pub(crate) fn from_checked(kind: ItemKind, items: BTreeMap<u64, BatchItem,>,) -> Self {
        Self {
            kind,
            items,
            created_at: Instant::now(),
        }
    }

    pub fn kind(&self,) -> ItemKind {
        self.kind
    }

    pub fn len(&self,) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self,) -> bool {
        self.items.is_empty()
    }

    pub fn created_at(&self,) -> Instant {
        self.created_at
    }

    pub fn items(&self,) -> &BTreeMap<u64, BatchItem,> {
        &self.items
    }

    pub fn sequences(&self,) -> impl Iterator<Item = u64,> + '_ {
        self.items.keys().copied()
    }

    pub fn into_items(self,) -> BTreeMap<u64, BatchItem,> {
        self.items
    }

    /// Builds the residual batch holding only `keep`. Returns `None` if nothing remains.
    pub fn subset(&self, keep: &[u64],) -> Option<Batch,> {
        let items: BTreeMap<u64, BatchItem,> = keep
            .iter()
            .filter_map(|seq| self.items.get(seq,).map(|item| (*seq, item.clone(),),),)
            .collect();
        if items.is_empty() {
            return None;
        }
        Some(Batch {
            kind: self.kind,
            items,
            created_at: self.created_at,
        },)
    }
}

/// How a failed item should be treated by the retry controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq,)]
pub enum FailureClass {
    /// Malformed item rejected by the server.
    Validation,
    /// Network trouble, throttling or a 5xx.
    Transient,
    /// 4xx other than 429.
    Permanent,
    /// The batch never reached the network because the limiter was cancelled.
    Cancelled,
}

impl FailureClass {
    pub fn is_retryable(self,) -> bool {
        matches!(self, FailureClass::Transient)
    }
}

#[derive(Debug, Clone, PartialEq, Eq,)]
pub struct ItemError {
    pub message:     String,
    pub status_code: Option<u16,>,
    pub class:       FailureClass,
}

impl ItemError {
    pub fn new(message: impl Into<String,>, status_code: Option<u16,>, class: FailureClass,) -> Self {
        Self {
            message: message.into(),
            status_code,
            class,
        }
    }

    /// Error for a whole-batch failure, derived from the transport error.
    pub fn from_batch_error(err: &BatchError,) -> Self {
        match err {
            BatchError::PermanentServer { status, message, } => {
                ItemError::new(message.clone(), Some(*status,), FailureClass::Permanent,)
            },
            BatchError::Validation(msg,) => ItemError::new(msg.clone(), None, FailureClass::Validation,),
            other if other.is_transient() => {
                ItemError::new(other.to_string(), None, FailureClass::Transient,)
            },
            other => ItemError::new(other.to_string(), None, FailureClass::Permanent,),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq,)]
pub enum ItemOutcome {
    Success { id: Option<Uuid,>, },
    Error(ItemError,),
}

impl ItemOutcome {
    pub fn is_success(&self,) -> bool {
        matches!(self, ItemOutcome::Success { .. })
    }

    pub fn error(&self,) -> Option<&ItemError,> {
        match self {
            ItemOutcome::Error(e,) => Some(e,),
            ItemOutcome::Success { .. } => None,
        }
    }
}

/// Final outcome for one queued item.
#[derive(Debug, Clone, PartialEq,)]
pub struct ItemResult {
    pub sequence: u64,
    pub item:     BatchItem,
    pub outcome:  ItemOutcome,
    pub attempts: u32,
}

/// Per-item outcomes ordered by sequence number.
///
/// Successes dropped by [`BatchResult::compact`] still count towards `len` and
/// `success_count` but are no longer listed.
#[derive(Debug, Clone, Default, PartialEq,)]
pub struct BatchResult {
    entries:   BTreeMap<u64, ItemResult,>,
    compacted: usize,
}

impl BatchResult {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, result: ItemResult,) {
        self.entries.insert(result.sequence, result,);
    }

    pub fn merge(&mut self, other: BatchResult,) {
        self.entries.extend(other.entries,);
        self.compacted += other.compacted;
    }

    /// Drops successful entries, keeping only their count. Failures stay in full.
    pub fn compact(&mut self,) {
        let before = self.entries.len();
        self.entries.retain(|_, r| !r.outcome.is_success(),);
        self.compacted += before - self.entries.len();
    }

    /// Number of outcomes, compacted successes included.
    pub fn len(&self,) -> usize {
        self.entries.len() + self.compacted
    }

    pub fn is_empty(&self,) -> bool {
        self.len() == 0
    }

    /// Number of entries still held in full.
    pub fn retained_len(&self,) -> usize {
        self.entries.len()
    }

    pub fn get(&self, sequence: u64,) -> Option<&ItemResult,> {
        self.entries.get(&sequence,)
    }

    pub fn iter(&self,) -> impl Iterator<Item = &ItemResult,> {
        self.entries.values()
    }

    pub fn successes(&self,) -> impl Iterator<Item = &ItemResult,> {
        self.entries.values().filter(|r| r.outcome.is_success(),)
    }

    pub fn failures(&self,) -> impl Iterator<Item = &ItemResult,> {
        self.entries.values().filter(|r| !r.outcome.is_success(),)
    }

    pub fn success_count(&self,) -> usize {
        self.successes().count() + self.compacted
    }

    pub fn failure_count(&self,) -> usize {
        self.failures().count()
    }

    /// Error result for items that never made it into a batch.
    pub fn rejected(items: BTreeMap<u64, BatchItem,>, error: ItemError,) -> Self {
        let mut result = BatchResult::empty();
        for (sequence, item,) in items {
            result.insert(ItemResult {
                sequence,
                item,
                outcome: ItemOutcome::Error(error.clone(),),
                attempts: 0,
            },);
        }
        result
    }

    /// Uniform error result for every item in `batch`.
    pub fn uniform_error(batch: &Batch, error: ItemError, attempts: u32,) -> Self {
        let mut result = BatchResult::empty();
        for (seq, item,) in batch.items() {
            result.insert(ItemResult {
                sequence: *seq,
                item: item.clone(),
                outcome: ItemOutcome::Error(error.clone(),),
                attempts,
            },);
        }
        result
    }
}

impl IntoIterator for BatchResult {
    type IntoIter = std::collections::btree_map::IntoValues<u64, ItemResult,>;
    type Item = ItemResult;

    fn into_iter(self,) -> Self::IntoIter {
        self.entries.into_values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID_A: &str = "8f14e45f-ceea-467a-9575-3d4c3f4a7b11";
    const ID_B: &str = "c9f0f895-fb98-4b91-a3b3-3a7f4e2d1c22";

    #[test]
    fn collection_names_are_normalized() {
        assert_eq!(normalize_collection_name("article").unwrap(), "Article");
        assert_eq!(normalize_collection_name("  Article ").unwrap(), "Article");
        assert!(normalize_collection_name("   ").is_err());
    }

    #[test]
    fn object_validation_happens_at_construction() {
        assert!(ObjectItem::new("", json!({})).is_err());
        assert!(ObjectItem::new("a", json!([1, 2])).is_err());
        assert!(ObjectItem::new("a", json!({})).unwrap().with_id_str("nope").is_err());
        assert!(ObjectItem::new("a", json!({})).unwrap().with_vector(vec![]).is_err());
        assert!(ObjectItem::new("a", json!({})).unwrap().with_tenant(" ").is_err());
    }

    #[test]
    fn object_wire_form() {
        let item = ObjectItem::new("article", json!({"title": "hello"}))
            .unwrap()
            .with_id_str(ID_A)
            .unwrap()
            .with_vector(vec![0.5, 1.0])
            .unwrap()
            .with_tenant("tenantA")
            .unwrap();

        let wire = item.to_wire();
        assert_eq!(wire["class"], "Article");
        assert_eq!(wire["id"], ID_A);
        assert_eq!(wire["properties"]["title"], "hello");
        assert_eq!(wire["vector"], json!([0.5, 1.0]));
        assert_eq!(wire["tenant"], "tenantA");
        assert!(wire.get("vectors").is_none());
    }

    #[test]
    fn reference_beacons() {
        let reference = ReferenceItem::new("author", ID_A, "wrote", "article", ID_B).unwrap();
        let wire = reference.to_wire();
        assert_eq!(wire["from"], format!("weaviate://localhost/Author/{}/wrote", ID_A));
        assert_eq!(wire["to"], format!("weaviate://localhost/Article/{}", ID_B));
        assert!(ReferenceItem::new("author", "x", "wrote", "article", ID_B).is_err());
        assert!(ReferenceItem::new("author", ID_A, "", "article", ID_B).is_err());
    }

    #[test]
    fn batch_bounds_and_subset() {
        let mut items = BTreeMap::new();
        for seq in 0..3 {
            items.insert(seq, BatchItem::from(ObjectItem::new("a", json!({})).unwrap()));
        }
        assert!(Batch::new(BTreeMap::new(), 3).is_err());
        assert!(Batch::new(items.clone(), 2).is_err());

        let batch = Batch::new(items, 3).unwrap();
        let residual = batch.subset(&[2]).unwrap();
        assert_eq!(residual.sequences().collect::<Vec<_>>(), vec![2]);
        assert!(batch.subset(&[9]).is_none());
    }

    #[test]
    fn mixed_batches_are_rejected() {
        let mut items = BTreeMap::new();
        items.insert(0, BatchItem::from(ObjectItem::new("a", json!({})).unwrap()));
        items.insert(
            1,
            BatchItem::from(ReferenceItem::new("a", ID_A, "p", "b", ID_B).unwrap()),
        );
        assert!(Batch::new(items, 10).is_err());
    }

    #[test]
    fn compacted_results_keep_failures_and_counts() {
        let mut result = BatchResult::empty();
        for seq in 0..4u64 {
            let outcome = if seq == 2 {
                ItemOutcome::Error(ItemError::new("shard unavailable", None, FailureClass::Transient))
            } else {
                ItemOutcome::Success { id: None }
            };
            result.insert(ItemResult {
                sequence: seq,
                item: BatchItem::from(ObjectItem::new("a", json!({ "n": seq })).unwrap()),
                outcome,
                attempts: 1,
            });
        }

        result.compact();
        assert_eq!(result.retained_len(), 1);
        assert_eq!(result.len(), 4);
        assert_eq!(result.success_count(), 3);
        assert_eq!(result.failures().next().unwrap().sequence, 2);

        let mut merged = BatchResult::empty();
        merged.merge(result);
        assert_eq!(merged.success_count(), 3);
        assert_eq!(merged.failure_count(), 1);
    }

    #[test]
    fn rejected_items_get_an_error_each() {
        let mut items = BTreeMap::new();
        for seq in 5..8 {
            items.insert(seq, BatchItem::from(ObjectItem::new("a", json!({})).unwrap()));
        }
        let error = ItemError::new("too large", None, FailureClass::Validation);
        let result = BatchResult::rejected(items, error);
        assert_eq!(result.failure_count(), 3);
        assert!(result.iter().all(|r| r.attempts == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn batch_timestamps_follow_the_runtime_clock() {
        let start = Instant::now();
        tokio::time::advance(std::time::Duration::from_secs(5)).await;

        let mut items = BTreeMap::new();
        items.insert(0, BatchItem::from(ObjectItem::new("a", json!({})).unwrap()));
        let batch = Batch::new(items, 1).unwrap();
        assert_eq!(batch.created_at() - start, std::time::Duration::from_secs(5));
        assert_eq!(batch.subset(&[0]).unwrap().created_at(), batch.created_at());
    }
}

