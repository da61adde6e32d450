//! In-process adapter that replays scripted responses per filter.
//!
//! Used for dry runs and by the test suites to drive the execution engine
//! through success, retry, partial and hang scenarios without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use super::{BugId, BugRecord, FetchError, TrackerAdapter};

struct Step {
    delay: Duration,
    result: Result<Vec<BugRecord>, FetchError>,
}

#[derive(Default)]
pub struct ScriptedTracker {
    steps: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next response for `filter`.
    pub fn push(&self, filter: &str, result: Result<Vec<BugRecord>, FetchError>) {
        self.push_delayed(filter, Duration::ZERO, result);
    }

    /// Queue a response that is returned only after `delay`.
    pub fn push_delayed(
        &self,
        filter: &str,
        delay: Duration,
        result: Result<Vec<BugRecord>, FetchError>,
    ) {
        let mut steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        steps
            .entry(filter.to_string())
            .or_default()
            .push_back(Step { delay, result });
    }

    /// Number of fetches issued for `filter` so far.
    pub fn calls(&self, filter: &str) -> usize {
        let calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
        calls.get(filter).copied().unwrap_or(0)
    }

    fn next_step(&self, filter: &str) -> Option<Step> {
        {
            let mut calls = self.calls.lock().unwrap_or_else(|e| e.into_inner());
            *calls.entry(filter.to_string()).or_default() += 1;
        }
        let mut steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        steps.get_mut(filter).and_then(|q| q.pop_front())
    }
}

#[async_trait::async_trait]
impl TrackerAdapter for ScriptedTracker {
    async fn fetch(&self, filter: &str, fields: &[String]) -> Result<Vec<BugRecord>, FetchError> {
        let step = self
            .next_step(filter)
            .ok_or_else(|| FetchError::Permanent(format!("no scripted response for '{}'", filter)))?;

        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }

        // Mirror a real tracker: only the requested fields come back.
        step.result.map(|records| {
            if fields.is_empty() {
                return records;
            }
            records
                .into_iter()
                .map(|mut r| {
                    r.fields.retain(|name, _| fields.iter().any(|f| f == name));
                    r
                })
                .collect()
        })
    }

    async fn test_filter(&self, filter: &str) -> Result<Vec<BugId>, FetchError> {
        let steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        match steps.get(filter).and_then(|q| q.front()) {
            Some(Step { result: Ok(records), .. }) => Ok(records.iter().map(|r| r.bug_id).collect()),
            Some(Step { result: Err(e), .. }) => Err(e.clone()),
            None => Err(FetchError::Permanent(format!("no scripted response for '{}'", filter))),
        }
    }
}
