use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::future::BoxFuture;

use super::{TargetValue, TokenExchanger, TokenGrant, UpstreamApi, UpstreamError, UpstreamResult};

/// Write observed by [`FakeUpstream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub access_token: String,
    pub group_id: i64,
    pub target_id: String,
    pub value: i64,
}

#[derive(Default)]
struct FakeState {
    values: HashMap<(i64, String), i64>,
    labels: HashMap<(i64, String), String>,
    reads: usize,
    writes: Vec<RecordedWrite>,
    read_failures: VecDeque<UpstreamError>,
    write_failures: VecDeque<UpstreamError>,
    refresh_results: VecDeque<UpstreamResult<TokenGrant>>,
    refresh_calls: Vec<String>,
    latency: Duration,
}

/// Scriptable in-process upstream. Unknown targets read as zero.
#[derive(Clone, Default)]
pub struct FakeUpstream {
    state: Arc<Mutex<FakeState>>,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_value(&self, group_id: i64, target_id: &str, value: i64) {
        self.lock().values.insert((group_id, target_id.to_owned()), value);
    }

    pub fn set_label(&self, group_id: i64, target_id: &str, label: &str) {
        self.lock()
            .labels
            .insert((group_id, target_id.to_owned()), label.to_owned());
    }

    pub fn value(&self, group_id: i64, target_id: &str) -> i64 {
        self.lock()
            .values
            .get(&(group_id, target_id.to_owned()))
            .copied()
            .unwrap_or_default()
    }

    /// Delay applied to every read and write.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn fail_next_read(&self, error: UpstreamError) {
        self.lock().read_failures.push_back(error);
    }

    pub fn fail_next_write(&self, error: UpstreamError) {
        self.lock().write_failures.push_back(error);
    }

    /// Queue the outcome of the next refresh. Unscripted refreshes succeed.
    pub fn push_refresh(&self, result: UpstreamResult<TokenGrant>) {
        self.lock().refresh_results.push_back(result);
    }

    pub fn reads(&self) -> usize {
        self.lock().reads
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.lock().writes.clone()
    }

    pub fn refresh_calls(&self) -> Vec<String> {
        self.lock().refresh_calls.clone()
    }
}

impl UpstreamApi for FakeUpstream {
    fn read_value(
        &self,
        _access_token: String,
        group_id: i64,
        target_id: String,
    ) -> BoxFuture<'static, UpstreamResult<TargetValue>> {
        let this = self.clone();
        Box::pin(async move {
            let latency = this.lock().latency;
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let mut state = this.lock();
            state.reads += 1;
            if let Some(err) = state.read_failures.pop_front() {
                return Err(err);
            }
            let key = (group_id, target_id);
            Ok(TargetValue {
                value: state.values.get(&key).copied().unwrap_or_default(),
                label: state.labels.get(&key).cloned(),
            })
        })
    }

    fn write_value(
        &self,
        access_token: String,
        group_id: i64,
        target_id: String,
        value: i64,
    ) -> BoxFuture<'static, UpstreamResult<()>> {
        let this = self.clone();
        Box::pin(async move {
            let latency = this.lock().latency;
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let mut state = this.lock();
            if let Some(err) = state.write_failures.pop_front() {
                return Err(err);
            }
            state.values.insert((group_id, target_id.clone()), value);
            state.writes.push(RecordedWrite {
                access_token,
                group_id,
                target_id,
                value,
            });
            Ok(())
        })
    }
}

impl TokenExchanger for FakeUpstream {
    fn refresh(&self, refresh_token: String) -> BoxFuture<'static, UpstreamResult<TokenGrant>> {
        let mut state = self.lock();
        state.refresh_calls.push(refresh_token);
        let call = state.refresh_calls.len();
        let result = state.refresh_results.pop_front().unwrap_or_else(|| {
            Ok(TokenGrant {
                access_token: format!("refreshed-{call}"),
                refresh_token: None,
                expires_in: Duration::from_secs(3_600),
            })
        });
        Box::pin(async move { result })
    }
}
