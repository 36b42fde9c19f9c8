use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Named steps of an SJob's pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Stage {
    #[serde(rename = "bootstrap")]
    Bootstrap,
    #[serde(rename = "dtn_matching")]
    DtnMatching,
    #[serde(rename = "network.wan")]
    NetworkWan,
    #[serde(rename = "network.lan_src")]
    NetworkLanSrc,
    #[serde(rename = "network.lan_dst")]
    NetworkLanDst,
    #[serde(rename = "network.verification")]
    PathVerification,
    #[serde(rename = "transfer.launch")]
    TransferLaunch,
    #[serde(rename = "transfer.transfer")]
    TransferTransfer,
    #[serde(rename = "checksum.verification")]
    ChecksumVerification,
    #[serde(rename = "teardown.lan")]
    TeardownLan,
    #[serde(rename = "teardown.wan")]
    TeardownWan,
}

impl Stage {
    pub const ALL: [Stage; 11] = [
        Stage::Bootstrap,
        Stage::DtnMatching,
        Stage::NetworkWan,
        Stage::NetworkLanSrc,
        Stage::NetworkLanDst,
        Stage::PathVerification,
        Stage::TransferLaunch,
        Stage::TransferTransfer,
        Stage::ChecksumVerification,
        Stage::TeardownLan,
        Stage::TeardownWan,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Bootstrap => "bootstrap",
            Stage::DtnMatching => "dtn_matching",
            Stage::NetworkWan => "network.wan",
            Stage::NetworkLanSrc => "network.lan_src",
            Stage::NetworkLanDst => "network.lan_dst",
            Stage::PathVerification => "network.verification",
            Stage::TransferLaunch => "transfer.launch",
            Stage::TransferTransfer => "transfer.transfer",
            Stage::ChecksumVerification => "checksum.verification",
            Stage::TeardownLan => "teardown.lan",
            Stage::TeardownWan => "teardown.wan",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Working,
    Success,
    Error,
}

/// Per-SJob progress markers, one per [`Stage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageMap {
    markers: BTreeMap<Stage, StageStatus>,
}

impl StageMap {
    /// All stages `pending` except `bootstrap`, which intake has just completed.
    pub fn seeded() -> Self {
        let mut markers: BTreeMap<Stage, StageStatus> = Stage::ALL.iter().map(|stage| (*stage, StageStatus::Pending)).collect();
        markers.insert(Stage::Bootstrap, StageStatus::Success);
        StageMap { markers }
    }

    pub fn get(&self, stage: Stage) -> StageStatus {
        self.markers.get(&stage).copied().unwrap_or(StageStatus::Pending)
    }

    pub fn set(&mut self, stage: Stage, status: StageStatus) {
        self.markers.insert(stage, status);
    }

    pub fn working(&mut self, stage: Stage) {
        self.set(stage, StageStatus::Working);
    }

    pub fn success(&mut self, stage: Stage) {
        self.set(stage, StageStatus::Success);
    }

    pub fn error(&mut self, stage: Stage) {
        self.set(stage, StageStatus::Error);
    }

    pub fn any_error(&self) -> bool {
        self.markers.values().any(|status| *status == StageStatus::Error)
    }
}

impl Default for StageMap {
    fn default() -> Self {
        Self::seeded()
    }
}

/// Callback told about every transition as a worker records it.
#[derive(Clone)]
pub struct StageObserver(Arc<dyn Fn(Stage, StageStatus) + Send + Sync>);

impl StageObserver {
    pub fn new<F>(notify: F) -> Self
    where
        F: Fn(Stage, StageStatus) + Send + Sync + 'static,
    {
        StageObserver(Arc::new(notify))
    }
}

impl fmt::Debug for StageObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StageObserver")
    }
}

/// Stage transitions recorded by a worker, replayed in order onto the owning SJob by the dispatch lane.
#[derive(Debug, Clone, Default)]
pub struct StageTrail {
    entries: Vec<(Stage, StageStatus)>,
    retries: u32,
    observer: Option<StageObserver>,
}

impl StageTrail {
    /// A trail that also reports each transition to `observer` as it happens.
    pub fn observed(observer: StageObserver) -> Self {
        StageTrail { observer: Some(observer), ..StageTrail::default() }
    }

    pub fn working(&mut self, stage: Stage) {
        self.record(stage, StageStatus::Working);
    }

    pub fn success(&mut self, stage: Stage) {
        self.record(stage, StageStatus::Success);
    }

    pub fn error(&mut self, stage: Stage) {
        self.record(stage, StageStatus::Error);
    }

    fn record(&mut self, stage: Stage, status: StageStatus) {
        self.entries.push((stage, status));
        if let Some(observer) = &self.observer {
            (observer.0)(stage, status);
        }
    }

    /// Counts one more attempt at a remote step that had already failed.
    pub fn retry(&mut self) {
        self.retries += 1;
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Latest status recorded for `stage`, if any.
    pub fn last(&self, stage: Stage) -> Option<StageStatus> {
        self.entries.iter().rev().find(|(s, _)| *s == stage).map(|(_, status)| *status)
    }

    /// Stage of the latest entry that did not end in success.
    pub fn current_stage(&self) -> Option<Stage> {
        self.entries.iter().rev().find(|(_, status)| *status != StageStatus::Success).map(|(stage, _)| *stage)
    }

    pub fn apply_to(&self, map: &mut StageMap) {
        for (stage, status) in &self.entries {
            map.set(*stage, *status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_map_marks_only_bootstrap_done() {
        let map = StageMap::seeded();
        assert_eq!(map.get(Stage::Bootstrap), StageStatus::Success);
        for stage in Stage::ALL.iter().skip(1) {
            assert_eq!(map.get(*stage), StageStatus::Pending, "{}", stage);
        }
    }

    #[test]
    fn trail_replays_in_order() {
        let mut trail = StageTrail::default();
        trail.working(Stage::NetworkLanSrc);
        trail.error(Stage::NetworkLanSrc);
        trail.working(Stage::TeardownLan);

        let mut map = StageMap::seeded();
        trail.apply_to(&mut map);
        assert_eq!(map.get(Stage::NetworkLanSrc), StageStatus::Error);
        assert_eq!(map.get(Stage::TeardownLan), StageStatus::Working);
        assert_eq!(trail.last(Stage::NetworkLanSrc), Some(StageStatus::Error));
        assert_eq!(trail.last(Stage::NetworkWan), None);
    }

    #[test]
    fn observer_sees_transitions_as_they_are_recorded() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut trail = StageTrail::observed(StageObserver::new(move |stage, status| sink.lock().unwrap().push((stage, status))));

        trail.working(Stage::NetworkWan);
        trail.success(Stage::NetworkWan);
        trail.working(Stage::NetworkLanSrc);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (Stage::NetworkWan, StageStatus::Working),
                (Stage::NetworkWan, StageStatus::Success),
                (Stage::NetworkLanSrc, StageStatus::Working),
            ]
        );
    }

    #[test]
    fn current_stage_is_the_last_one_not_done() {
        let mut trail = StageTrail::default();
        assert_eq!(trail.current_stage(), None);

        trail.success(Stage::DtnMatching);
        assert_eq!(trail.current_stage(), None);

        trail.working(Stage::NetworkLanSrc);
        trail.success(Stage::NetworkLanSrc);
        trail.working(Stage::NetworkLanDst);
        assert_eq!(trail.current_stage(), Some(Stage::NetworkLanDst));
    }

    #[test]
    fn serializes_with_dotted_names() {
        let mut map = StageMap::seeded();
        map.error(Stage::NetworkLanSrc);
        let json = serde_json::to_value(&map).unwrap();
        assert_eq!(json["network.lan_src"], "error");
        assert_eq!(json["bootstrap"], "success");

        let back: StageMap = serde_json::from_value(json).unwrap();
        assert_eq!(back, map);
        assert!(back.any_error());
    }
}
