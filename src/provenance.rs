//! Provenance records.
//!
//! A reduction adds a line to the "history" attribute describing the command that produced it,
//! followed by the history of each input file. Image consumers embed the same record under a
//! format specific metadata key.
//!
//! [MetadataKey] is not used by the reduction itself. It is the hook for downstream plotting
//! tools, which look up the key for the image format they write and store the history under it.

use std::path::PathBuf;

use strum_macros::Display;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::error::ReductionError;

/// Image metadata key under which the history record is stored.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum MetadataKey {
    History,
    Title,
    Creator,
}

impl MetadataKey {
    /// The key for an output file extension.
    pub fn for_format(format: &str) -> Result<Self, ReductionError> {
        match format.to_ascii_lowercase().as_str() {
            "png" => Ok(Self::History),
            "pdf" | "svg" => Ok(Self::Title),
            "eps" | "ps" => Ok(Self::Creator),
            _ => Err(ReductionError::UnsupportedFormat {
                format: format.to_string(),
            }),
        }
    }
}

/// Build a history record for the current time.
///
/// # Arguments
///
/// * `command`: The command line, program first
/// * `inputs`: Input files with their own history, in order
pub fn new_log(
    command: &[String],
    inputs: &[(PathBuf, Option<String>)],
) -> Result<String, ReductionError> {
    new_log_at(OffsetDateTime::now_utc(), command, inputs)
}

/// Build a history record with a given timestamp.
pub fn new_log_at(
    timestamp: OffsetDateTime,
    command: &[String],
    inputs: &[(PathBuf, Option<String>)],
) -> Result<String, ReductionError> {
    // e.g. "Tue Mar 05 14:02:11 2024"
    let format = format_description!(
        "[weekday repr:short] [month repr:short] [day] [hour]:[minute]:[second] [year]"
    );
    let mut log = format!("{}: {}", timestamp.format(format)?, command.join(" "));
    for (path, history) in inputs {
        if let Some(history) = history {
            log.push_str(&format!("\nHistory of {}:\n{}", path.display(), history));
        }
    }
    Ok(log)
}
