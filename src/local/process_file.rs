use crate::config::Config;
use crate::engine::Engine;
use crate::error::{NeuroLayerError, Result};
use crate::processing::AVERAGE;
use crate::session::NullPresentation;

use log::info;
use ndarray::Array2;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Deserialize)]
struct EventRow {
    sample_number: u64,
    #[serde(default)]
    line: u8,
    #[serde(default)]
    group: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OfflineSummary {
    pub events: usize,
    pub snapshots: usize,
    pub views: Vec<String>,
}

fn read_events(path: &Path) -> Result<Vec<EventRow>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| NeuroLayerError::Config(format!("Failed to open events file: {}", e)))?;
    reader
        .deserialize()
        .collect::<std::result::Result<Vec<EventRow>, _>>()
        .map_err(|e| NeuroLayerError::Config(format!("Failed to parse events file: {}", e)))
}

/// Writes one row per channel: channel index followed by the samples.
pub fn write_matrix(path: &Path, x_axis: &[f64], matrix: &Array2<f64>) -> Result<()> {
    let to_io = |e: csv::Error| NeuroLayerError::Io(e.into());
    let mut writer = csv::Writer::from_path(path).map_err(to_io)?;

    let mut header = vec!["channel".to_string()];
    header.extend(x_axis.iter().map(|x| format!("{:.4}", x)));
    writer.write_record(&header).map_err(to_io)?;

    for (channel, row) in matrix.rows().into_iter().enumerate() {
        let mut record = vec![channel.to_string()];
        record.extend(row.iter().map(|v| v.to_string()));
        writer.write_record(&record).map_err(to_io)?;
    }
    writer.flush()?;
    Ok(())
}

/// Runs every event of `events_csv` against an existing recording and writes the
/// mean snapshot of "Average" (and of each group named in the csv) into `output_dir`.
pub fn run(config: &Config, recording: &Path, events_csv: &Path, output_dir: &Path) -> Result<OfflineSummary> {
    let start_time = Instant::now();
    let rows = read_events(events_csv)?;

    let mut config = config.clone();
    // every event in the file counts
    config.events.max_events = 0;
    let mut lines: Vec<u8> = rows.iter().map(|r| r.line).collect();
    lines.sort_unstable();
    lines.dedup();
    config.events.enabled_lines = lines;

    let engine = Engine::new(&config, Arc::new(NullPresentation), None)?;
    engine.attach_file(recording)?;

    let mut groups: std::collections::BTreeMap<String, Vec<u64>> = Default::default();
    for row in &rows {
        engine.register_event(row.sample_number, row.line)?;
        if let Some(group) = &row.group {
            groups.entry(group.clone()).or_default().push(row.sample_number);
        }
    }
    for (name, members) in &groups {
        engine.add_group(name, members.clone())?;
    }
    engine.flush()?;

    std::fs::create_dir_all(output_dir)?;
    let mut views = vec![AVERAGE.to_string()];
    views.extend(groups.keys().cloned());
    for view in &views {
        let (x_axis, matrix) = engine.grouped_view(view);
        write_matrix(&output_dir.join(format!("{}.csv", view)), &x_axis, &matrix)?;
    }

    let summary = OfflineSummary {
        events: engine.events().len(),
        snapshots: engine.snapshots().len(),
        views,
    };
    info!(
        "Processed {} events ({} snapshots) in {:?}",
        summary.events,
        summary.snapshots,
        start_time.elapsed()
    );
    Ok(summary)
}
