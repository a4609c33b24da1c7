//! GOOSE Scheduler
//!
//! Status/sequence-number retransmission timing for GOOSE control blocks.
//!
//! ```text
//!   change ──► stNum+1, sqNum=0, interval=minTime, send now
//!              │
//!              ▼
//!   send ──► TAL = 2 × interval
//!            interval = minTime            (first send after a change)
//!                     = min(2 × interval, maxTime)   (otherwise)
//!            sqNum += 1, nextTx = now + interval
//! ```
//!
//! Timing is evaluated on each engine tick, so intervals are quantized to
//! the tick period.

use std::collections::BTreeMap;

use gridsim_types::Value;
use serde::{Deserialize, Serialize};
use tracing::debug;
use ts_rs::TS;

use crate::datamodel::DataModel;

/// Delay before the first transmission of a newly registered publisher
pub const INITIAL_TX_DELAY_MS: u64 = 100;

/// Publisher configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct GooseConfig {
    #[serde(rename = "appID", alias = "app_id")]
    pub app_id: u16,
    #[serde(default = "default_conf_rev", alias = "conf_rev")]
    pub conf_rev: u32,
    /// Shortest retransmission interval (ms)
    #[serde(default = "default_min_time", alias = "min_time")]
    #[ts(type = "number")]
    pub min_time: u64,
    /// Longest retransmission interval (ms)
    #[serde(default = "default_max_time", alias = "max_time")]
    #[ts(type = "number")]
    pub max_time: u64,
    #[serde(default, alias = "dat_set")]
    pub dat_set: String,
}

fn default_conf_rev() -> u32 {
    1
}

fn default_min_time() -> u64 {
    10
}

fn default_max_time() -> u64 {
    1_000
}

/// One emitted GOOSE message
#[derive(Debug, Clone, PartialEq, Serialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct GooseFrame {
    pub go_cb_ref: String,
    #[serde(rename = "appID")]
    pub app_id: u16,
    pub st_num: u32,
    pub sq_num: u32,
    pub dat_set: String,
    pub conf_rev: u32,
    #[ts(type = "number")]
    pub time_allowed_to_live: u64,
    #[ts(type = "number")]
    pub timestamp: u64,
    /// Dataset members in dataset order
    pub data: Vec<(String, Value)>,
}

/// Publisher state keyed by control-block path
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GoosePublisher {
    pub go_cb_ref: String,
    pub config: GooseConfig,
    pub dataset: Vec<String>,
    pub enabled: bool,
    pub st_num: u32,
    pub sq_num: u32,
    pub next_tx: u64,
    pub current_interval: u64,
    /// Retransmitting faster than `max_time`
    pub burst_mode: bool,
    #[serde(skip)]
    cache: Vec<Value>,
}

impl GoosePublisher {
    /// Snapshot of the dataset as last seen
    pub fn data(&self) -> Vec<(String, Value)> {
        self.dataset
            .iter()
            .cloned()
            .zip(self.cache.iter().cloned())
            .collect()
    }

    fn min_time(&self) -> u64 {
        self.config.min_time.max(1)
    }

    fn max_time(&self) -> u64 {
        self.config.max_time.max(self.min_time())
    }

    /// New status: bump stNum and send immediately at `min_time`
    fn burst(&mut self, now_ms: u64) {
        self.st_num = self.st_num.wrapping_add(1).max(1);
        self.sq_num = 0;
        self.current_interval = self.min_time();
        self.next_tx = now_ms;
        self.burst_mode = true;
    }

    fn snapshot(&mut self, model: &DataModel) {
        self.cache = self
            .dataset
            .iter()
            .map(|path| model.read_mms(path).cloned().unwrap_or_default())
            .collect();
    }
}

/// Retransmission scheduler for every registered publisher
#[derive(Debug, Clone, Default)]
pub struct GooseScheduler {
    publishers: BTreeMap<String, GoosePublisher>,
}

impl GooseScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a publisher
    pub fn register(
        &mut self,
        path: &str,
        config: GooseConfig,
        dataset: Vec<String>,
        model: &DataModel,
        now_ms: u64,
    ) {
        let mut publisher = GoosePublisher {
            go_cb_ref: path.to_string(),
            current_interval: config.max_time,
            config,
            dataset,
            enabled: true,
            st_num: 1,
            sq_num: 0,
            next_tx: now_ms.saturating_add(INITIAL_TX_DELAY_MS),
            burst_mode: false,
            cache: Vec::new(),
        };
        publisher.current_interval = publisher.max_time();
        publisher.snapshot(model);
        debug!(path, members = publisher.dataset.len(), "GOOSE publisher registered");
        self.publishers.insert(path.to_string(), publisher);
    }

    pub fn unregister(&mut self, path: &str) -> bool {
        self.publishers.remove(path).is_some()
    }

    /// Enable or disable a publisher; disabled publishers neither react nor send
    pub fn set_enabled(&mut self, path: &str, enabled: bool) -> bool {
        match self.publishers.get_mut(path) {
            Some(publisher) => {
                publisher.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// A dataset member changed value
    pub fn on_data_change(&mut self, path: &str, value: &Value, now_ms: u64) {
        for publisher in self.publishers.values_mut().filter(|p| p.enabled) {
            let Some(index) = publisher.dataset.iter().position(|m| m == path) else {
                continue;
            };
            publisher.cache[index] = value.clone();
            publisher.burst(now_ms);
            debug!(
                go_cb_ref = %publisher.go_cb_ref,
                st_num = publisher.st_num,
                path,
                "GOOSE state change"
            );
        }
    }

    /// Emit every publisher that is due
    pub fn tick(&mut self, now_ms: u64) -> Vec<GooseFrame> {
        let mut frames = Vec::new();
        for publisher in self.publishers.values_mut().filter(|p| p.enabled) {
            if now_ms < publisher.next_tx {
                continue;
            }

            frames.push(GooseFrame {
                go_cb_ref: publisher.go_cb_ref.clone(),
                app_id: publisher.config.app_id,
                st_num: publisher.st_num,
                sq_num: publisher.sq_num,
                dat_set: publisher.config.dat_set.clone(),
                conf_rev: publisher.config.conf_rev,
                time_allowed_to_live: publisher.current_interval.saturating_mul(2),
                timestamp: now_ms,
                data: publisher.data(),
            });

            publisher.current_interval = if publisher.sq_num == 0 {
                publisher.min_time()
            } else {
                publisher.current_interval.saturating_mul(2).min(publisher.max_time())
            };
            publisher.burst_mode = publisher.current_interval < publisher.max_time();
            publisher.sq_num = publisher.sq_num.wrapping_add(1);
            publisher.next_tx = now_ms.saturating_add(publisher.current_interval);
        }
        frames
    }

    /// Replace a publisher's configuration; treated as a data change
    pub fn update_config(&mut self, path: &str, config: GooseConfig, now_ms: u64) -> bool {
        let Some(publisher) = self.publishers.get_mut(path) else {
            return false;
        };
        publisher.config = config;
        publisher.burst(now_ms);
        true
    }

    /// Replace a publisher's dataset; treated as a data change
    pub fn update_dataset(
        &mut self,
        path: &str,
        dataset: Vec<String>,
        model: &DataModel,
        now_ms: u64,
    ) -> bool {
        let Some(publisher) = self.publishers.get_mut(path) else {
            return false;
        };
        publisher.dataset = dataset;
        publisher.snapshot(model);
        publisher.burst(now_ms);
        true
    }

    pub fn publisher(&self, path: &str) -> Option<&GoosePublisher> {
        self.publishers.get(path)
    }

    pub fn publishers(&self) -> impl Iterator<Item = &GoosePublisher> {
        self.publishers.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOCB: &str = "IED1LD0/LLN0.gcb01";
    const MEMBER: &str = "IED1LD0/XCBR1.Pos.stVal";

    fn config() -> GooseConfig {
        GooseConfig {
            app_id: 0x3001,
            conf_rev: 1,
            min_time: 10,
            max_time: 160,
            dat_set: "IED1LD0/LLN0.DS1".into(),
        }
    }

    fn scheduler(model: &DataModel) -> GooseScheduler {
        let mut scheduler = GooseScheduler::new();
        scheduler.register(GOCB, config(), vec![MEMBER.into()], model, 0);
        scheduler
    }

    #[test]
    fn test_register_initial_state() {
        let mut model = DataModel::new();
        model.write_mms(MEMBER, Value::Int(1));
        let mut scheduler = scheduler(&model);
        let publisher = scheduler.publisher(GOCB).unwrap();
        assert_eq!((publisher.st_num, publisher.sq_num), (1, 0));
        assert_eq!(publisher.next_tx, INITIAL_TX_DELAY_MS);
        assert_eq!(publisher.current_interval, 160);

        assert!(scheduler.tick(99).is_empty());
        let frames = scheduler.tick(100);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, vec![(MEMBER.to_string(), Value::Int(1))]);
        assert_eq!(frames[0].time_allowed_to_live, 320);
    }

    #[test]
    fn test_change_bursts_at_min_time() {
        let model = DataModel::new();
        let mut scheduler = scheduler(&model);
        scheduler.tick(100);

        scheduler.on_data_change(MEMBER, &Value::Int(2), 150);
        let publisher = scheduler.publisher(GOCB).unwrap();
        assert_eq!((publisher.st_num, publisher.sq_num), (2, 0));

        let frames = scheduler.tick(150);
        assert_eq!(frames[0].st_num, 2);
        assert_eq!(frames[0].sq_num, 0);
        assert_eq!(frames[0].time_allowed_to_live, 20);
        assert_eq!(scheduler.publisher(GOCB).unwrap().current_interval, 10);
    }

    #[test]
    fn test_huge_max_time_saturates() {
        let model = DataModel::new();
        let mut scheduler = GooseScheduler::new();
        let huge = GooseConfig {
            min_time: u64::MAX / 2 + 1,
            max_time: u64::MAX,
            ..config()
        };
        scheduler.register(GOCB, huge, vec![MEMBER.into()], &model, 0);

        let frames = scheduler.tick(100);
        assert_eq!(frames[0].time_allowed_to_live, u64::MAX);
        let publisher = scheduler.publisher(GOCB).unwrap();
        assert_eq!(publisher.current_interval, u64::MAX / 2 + 1);
        assert_eq!(publisher.next_tx, 100 + u64::MAX / 2 + 1);

        let frames = scheduler.tick(u64::MAX);
        assert_eq!(frames[0].sq_num, 1);
        assert_eq!(frames[0].time_allowed_to_live, u64::MAX);
        let publisher = scheduler.publisher(GOCB).unwrap();
        assert_eq!(publisher.current_interval, u64::MAX);
        assert_eq!(publisher.next_tx, u64::MAX);
    }

    #[test]
    fn test_intervals_double_up_to_max_time() {
        let model = DataModel::new();
        let mut scheduler = scheduler(&model);
        scheduler.on_data_change(MEMBER, &Value::Int(2), 0);

        let mut now = 0;
        let mut intervals = Vec::new();
        for _ in 0..7 {
            let frames = scheduler.tick(now);
            assert_eq!(frames.len(), 1);
            let interval = scheduler.publisher(GOCB).unwrap().current_interval;
            intervals.push(interval);
            now += interval;
        }
        assert_eq!(intervals, vec![10, 20, 40, 80, 160, 160, 160]);
        assert!(!scheduler.publisher(GOCB).unwrap().burst_mode);
    }

    #[test]
    fn test_unrelated_change_is_ignored() {
        let model = DataModel::new();
        let mut scheduler = scheduler(&model);
        scheduler.on_data_change("IED1LD0/MMXU1.TotW.mag.f", &Value::Float(1.0), 50);
        assert_eq!(scheduler.publisher(GOCB).unwrap().st_num, 1);
    }

    #[test]
    fn test_disabled_publisher_is_silent() {
        let model = DataModel::new();
        let mut scheduler = scheduler(&model);
        scheduler.set_enabled(GOCB, false);
        scheduler.on_data_change(MEMBER, &Value::Int(2), 0);
        assert!(scheduler.tick(1_000).is_empty());
        assert_eq!(scheduler.publisher(GOCB).unwrap().st_num, 1);
    }

    #[test]
    fn test_reconfiguration_forces_burst() {
        let model = DataModel::new();
        let mut scheduler = scheduler(&model);
        let mut cfg = config();
        cfg.conf_rev = 2;
        assert!(scheduler.update_config(GOCB, cfg, 40));
        let frames = scheduler.tick(40);
        assert_eq!(frames[0].conf_rev, 2);
        assert_eq!(frames[0].st_num, 2);

        assert!(scheduler.update_dataset(GOCB, vec![], &model, 60));
        assert_eq!(scheduler.publisher(GOCB).unwrap().st_num, 3);
    }
}
