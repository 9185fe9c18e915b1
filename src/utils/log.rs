use chrono::Local;
use log::LevelFilter;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Installs the console logger. `RUST_LOG` still overrides the default level.
pub fn init_logger(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let _ = env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .try_init();
}

/// Appends a message with a timestamp header to `log_dir/filename`.
pub fn log_to_file(log_dir: &Path, filename: &str, message: &str) -> io::Result<()> {
    fs::create_dir_all(log_dir)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_dir.join(filename))?;

    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    writeln!(file, "\n--- Log entry at {} ---", timestamp)?;
    writeln!(file, "{}", message)?;
    writeln!(file, "--- End of entry ---")?;
    file.flush()
}

pub fn log_with_header(log_dir: &Path, filename: &str, header: &str, message: &str) -> io::Result<()> {
    let formatted_message = format!("===== {} =====\n{}\n====================", header, message);
    log_to_file(log_dir, filename, &formatted_message)
}

/// Appends one row to a CSV file, writing `headers` first if the file is new.
pub fn log_csv(log_dir: &Path, filename: &str, headers: &[&str], data: &[String]) -> io::Result<()> {
    fs::create_dir_all(log_dir)?;
    let path = log_dir.join(filename);
    let file_exists = path.exists();

    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    let mut writer = csv::Writer::from_writer(file);
    if !file_exists && !headers.is_empty() {
        writer.write_record(headers)?;
    }
    writer.write_record(data)?;
    writer.flush()
}
