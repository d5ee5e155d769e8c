//! Scripted in-memory metadata source for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{Notify, Semaphore};

use crate::upstream::{MetadataSource, PageRequest, RawPage, UpstreamError};
use metacache_core::{LabelKey, MetadataVersion, RecordKind};

pub(crate) fn version(app: &str) -> MetadataVersion {
    MetadataVersion {
        application_version: app.to_string(),
        platform_version: "7.0.7000".to_string(),
        application_build: format!("{app}.1"),
        platform_build: "7.0.7000.10".to_string(),
    }
}

pub(crate) fn entity_json(name: &str, label_id: Option<&str>) -> Value {
    let mut value = json!({
        "Name": name,
        "PublicEntityName": name.trim_end_matches('s'),
        "PublicCollectionName": name,
        "EntityCategory": "Master",
        "DataServiceEnabled": true,
        "Keys": ["dataAreaId"],
    });
    if let Some(label_id) = label_id {
        value["LabelId"] = json!(label_id);
    }
    value
}

pub(crate) fn modified_entity_json(name: &str, modified_at: &str) -> Value {
    let mut value = entity_json(name, None);
    value["ModifiedDateTime"] = json!(modified_at);
    value
}

pub(crate) fn enum_json(name: &str, label_id: &str) -> Value {
    json!({
        "Name": name,
        "LabelId": label_id,
        "Members": [{"Name": "No", "Value": 0}, {"Name": "Yes", "Value": 1}],
    })
}

struct PageGate {
    /// Fetches with an index at or beyond this wait for a release.
    from_call: usize,
    blocked: Notify,
    release: Semaphore,
}

/// A [`MetadataSource`] whose responses are set up by the test.
///
/// Pages are served in order with the page index as continuation token.
pub(crate) struct FakeSource {
    version: Mutex<MetadataVersion>,
    version_failure: Mutex<Option<UpstreamError>>,
    pages: Mutex<HashMap<RecordKind, Vec<Vec<Value>>>>,
    page_failures: Mutex<VecDeque<UpstreamError>>,
    labels: Mutex<HashMap<LabelKey, String>>,
    label_failure: Mutex<Option<UpstreamError>>,
    label_requests: Mutex<Vec<Vec<LabelKey>>>,
    gate: Mutex<Option<Arc<PageGate>>>,
    version_calls: AtomicUsize,
    page_calls: AtomicUsize,
}

impl FakeSource {
    pub(crate) fn new(version: MetadataVersion) -> Self {
        FakeSource {
            version: Mutex::new(version),
            version_failure: Mutex::new(None),
            pages: Mutex::new(HashMap::new()),
            page_failures: Mutex::new(VecDeque::new()),
            labels: Mutex::new(HashMap::new()),
            label_failure: Mutex::new(None),
            label_requests: Mutex::new(Vec::new()),
            gate: Mutex::new(None),
            version_calls: AtomicUsize::new(0),
            page_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_version(&self, version: MetadataVersion) {
        *self.version.lock() = version;
        *self.version_failure.lock() = None;
    }

    /// Every version check fails with `err` until [`FakeSource::set_version`].
    pub(crate) fn fail_version(&self, err: UpstreamError) {
        *self.version_failure.lock() = Some(err);
    }

    pub(crate) fn set_pages(&self, kind: RecordKind, pages: Vec<Vec<Value>>) {
        self.pages.lock().insert(kind, pages);
    }

    /// The next page fetches fail with these errors, in order.
    pub(crate) fn fail_pages(&self, errors: impl IntoIterator<Item = UpstreamError>) {
        self.page_failures.lock().extend(errors);
    }

    pub(crate) fn set_label(&self, label_id: &str, language: &str, text: &str) {
        self.labels
            .lock()
            .insert(LabelKey::new(label_id, language), text.to_string());
    }

    pub(crate) fn fail_labels(&self, err: Option<UpstreamError>) {
        *self.label_failure.lock() = err;
    }

    /// Page fetches from the `from_call`-th on (0-based, across kinds) block
    /// until [`FakeSource::release_pages`] hands out permits.
    pub(crate) fn hold_pages_from(&self, from_call: usize) {
        *self.gate.lock() = Some(Arc::new(PageGate {
            from_call,
            blocked: Notify::new(),
            release: Semaphore::new(0),
        }));
    }

    /// Waits until a page fetch is parked at the gate.
    pub(crate) async fn page_blocked(&self) {
        let gate = self.gate.lock().clone();
        if let Some(gate) = gate {
            gate.blocked.notified().await;
        }
    }

    pub(crate) fn release_pages(&self, n: usize) {
        if let Some(gate) = self.gate.lock().as_ref() {
            gate.release.add_permits(n);
        }
    }

    pub(crate) fn version_calls(&self) -> usize {
        self.version_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    /// Keys of every label batch request, in call order.
    pub(crate) fn label_requests(&self) -> Vec<Vec<LabelKey>> {
        self.label_requests.lock().clone()
    }
}

#[async_trait]
impl MetadataSource for FakeSource {
    async fn fetch_metadata_page(
        &self,
        kind: RecordKind,
        request: &PageRequest,
    ) -> Result<RawPage, UpstreamError> {
        let call = self.page_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().clone();
        if let Some(gate) = gate.filter(|g| call >= g.from_call) {
            gate.blocked.notify_one();
            if let Ok(permit) = gate.release.acquire().await {
                permit.forget();
            }
        }

        if let Some(err) = self.page_failures.lock().pop_front() {
            return Err(err);
        }

        let index: usize = match &request.continuation {
            Some(token) => token
                .parse()
                .map_err(|_| UpstreamError::Malformed(format!("bad token {token}")))?,
            None => 0,
        };

        let pages = self.pages.lock();
        let kind_pages = pages.get(&kind).cloned().unwrap_or_default();
        let total = kind_pages.iter().map(|p| p.len() as u64).sum();
        let records = kind_pages.get(index).cloned().unwrap_or_default();
        let next = (index + 1 < kind_pages.len()).then(|| (index + 1).to_string());

        Ok(RawPage {
            records,
            next,
            total: Some(total),
        })
    }

    async fn fetch_version(&self) -> Result<MetadataVersion, UpstreamError> {
        self.version_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.version_failure.lock().clone() {
            return Err(err);
        }
        Ok(self.version.lock().clone())
    }

    async fn fetch_labels_batch(
        &self,
        keys: &[LabelKey],
    ) -> Result<HashMap<LabelKey, String>, UpstreamError> {
        self.label_requests.lock().push(keys.to_vec());
        if let Some(err) = self.label_failure.lock().clone() {
            return Err(err);
        }
        let labels = self.labels.lock();
        Ok(keys
            .iter()
            .filter_map(|k| labels.get(k).map(|text| (k.clone(), text.clone())))
            .collect())
    }
}
