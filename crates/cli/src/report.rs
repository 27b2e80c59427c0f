// Failure report sink: one JSON object per line

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use bulkmut_engine::FailureRecord;

/// Write `failures` to `path`, replacing any previous report
pub fn write_failures(path: &Path, failures: &[FailureRecord]) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create failure report {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for failure in failures {
        serde_json::to_writer(&mut writer, failure)?;
        writer.write_all(b"\n")?;
    }
    writer
        .flush()
        .with_context(|| format!("Failed to write failure report {}", path.display()))?;
    Ok(())
}
