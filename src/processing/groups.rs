use crate::config::TRIGGER_LINES;

use ndarray::Array2;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Name of the implicit group holding every event that is not excluded.
pub const AVERAGE: &str = "Average";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub timestamp: u64,
    pub line: u8,
}

/// Why an event was not registered. Not an error: the caller just drops it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoredTrigger {
    LineDisabled,
    CapReached,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// `cap_reached` is set on the event that fills the per-session cap.
    Accepted { cap_reached: bool },
    Ignored(IgnoredTrigger),
}

/// Which timestamps a view name resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupMembers {
    Known(Vec<u64>),
    Unknown,
}

/// Accepted events of the current session and the named groups built from them.
#[derive(Debug, Clone)]
pub struct EventRegistry {
    enabled_lines: u32,
    max_events: usize,
    records: Vec<EventRecord>,
    groups: BTreeMap<String, Vec<u64>>,
    excluded: BTreeSet<u64>,
}

impl EventRegistry {
    pub fn new(enabled_lines: &[u8], max_events: usize) -> Self {
        let mut registry = Self {
            enabled_lines: 0,
            max_events,
            records: Vec::new(),
            groups: BTreeMap::new(),
            excluded: BTreeSet::new(),
        };
        registry.set_enabled_lines(enabled_lines);
        registry
    }

    pub fn enabled_mask(&self) -> u32 {
        self.enabled_lines
    }

    pub fn enabled_lines(&self) -> Vec<u8> {
        (0..TRIGGER_LINES as u8).filter(|&l| self.is_enabled(l)).collect()
    }

    pub fn is_enabled(&self, line: u8) -> bool {
        (line as usize) < TRIGGER_LINES && self.enabled_lines & (1 << line) != 0
    }

    /// Lines outside `0..32` are ignored.
    pub fn set_line(&mut self, line: u8, enabled: bool) {
        if (line as usize) >= TRIGGER_LINES {
            return;
        }
        if enabled {
            self.enabled_lines |= 1 << line;
        } else {
            self.enabled_lines &= !(1 << line);
        }
    }

    pub fn set_enabled_lines(&mut self, lines: &[u8]) {
        self.enabled_lines = 0;
        for &line in lines {
            self.set_line(line, true);
        }
    }

    pub fn max_events(&self) -> usize {
        self.max_events
    }

    /// 0 means no cap.
    pub fn set_max_events(&mut self, max_events: usize) {
        self.max_events = max_events;
    }

    pub fn cap_reached(&self) -> bool {
        self.max_events > 0 && self.records.len() >= self.max_events
    }

    pub fn register_event(&mut self, timestamp: u64, line: u8) -> Admission {
        if !self.is_enabled(line) {
            return Admission::Ignored(IgnoredTrigger::LineDisabled);
        }
        if self.cap_reached() {
            return Admission::Ignored(IgnoredTrigger::CapReached);
        }
        if self.contains(timestamp) {
            return Admission::Ignored(IgnoredTrigger::Duplicate);
        }
        self.records.push(EventRecord { timestamp, line });
        Admission::Accepted {
            cap_reached: self.cap_reached(),
        }
    }

    pub fn contains(&self, timestamp: u64) -> bool {
        self.records.iter().any(|r| r.timestamp == timestamp)
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    pub fn timestamps(&self) -> Vec<u64> {
        self.records.iter().map(|r| r.timestamp).collect()
    }

    /// Creates or overwrites a named group.
    /// Sets the members of `name`; true when the group did not exist before.
    pub fn add_group(&mut self, name: &str, timestamps: Vec<u64>) -> bool {
        self.groups.insert(name.to_string(), timestamps).is_none()
    }

    pub fn groups(&self) -> &BTreeMap<String, Vec<u64>> {
        &self.groups
    }

    pub fn exclude(&mut self, timestamp: u64) {
        self.excluded.insert(timestamp);
    }

    pub fn include(&mut self, timestamp: u64) {
        self.excluded.remove(&timestamp);
    }

    pub fn excluded(&self) -> &BTreeSet<u64> {
        &self.excluded
    }

    /// Resolves a view name: "Average", a named group, or an event's own label.
    pub fn members(&self, name: &str) -> GroupMembers {
        if name == AVERAGE {
            return GroupMembers::Known(
                self.records
                    .iter()
                    .map(|r| r.timestamp)
                    .filter(|ts| !self.excluded.contains(ts))
                    .collect(),
            );
        }
        if let Some(members) = self.groups.get(name) {
            return GroupMembers::Known(members.clone());
        }
        match name.parse::<u64>() {
            Ok(ts) if self.contains(ts) => GroupMembers::Known(vec![ts]),
            _ => GroupMembers::Unknown,
        }
    }

    /// Drops every event and group, keeping the line mask and cap.
    pub fn clear(&mut self) {
        self.records.clear();
        self.groups.clear();
        self.excluded.clear();
    }
}

/// Elementwise mean of `snapshots`, or zeros of `shape` when there is nothing to average.
/// Snapshots of a different shape (left over from another duration) are skipped.
pub fn mean_of(snapshots: &[Arc<Array2<f64>>], shape: (usize, usize)) -> Array2<f64> {
    let mut sum = Array2::<f64>::zeros(shape);
    let mut count = 0usize;
    for snapshot in snapshots.iter().filter(|s| s.dim() == shape) {
        sum += snapshot.as_ref();
        count += 1;
    }
    if count > 0 {
        sum /= count as f64;
    }
    sum
}
