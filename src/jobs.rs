//! Job status file (`STATUS`) written by the workflow runner
//!
//! ```text
//! Current host                    : node-17/x86_64  file-server:fs-01
//! MAKE_DIRECTORY                  : 16:26:21 .... 16:26:21
//! ECLIPSE100                      : 16:26:24 .... 16:28:55   EXIT: 1/License failure
//! RMS_BATCH                       : 16:29:01 ....
//! ```
//!
//! The first line is a host header. Each following line is one job; text
//! after the end time is the job's error message.
//!
//! Parsed jobs are also exposed as a table artifact, one row per job keyed
//! by [`JOB_INDEX_COLUMN`], so job timings aggregate across an ensemble like
//! any other artifact.

use std::path::Path;

use chrono::NaiveTime;
use serde::Serialize;
use tracing::warn;

use crate::record::{IndexKey, TimeRow, TimeTable, Value};
use crate::Result;

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Index column of the job table.
pub const JOB_INDEX_COLUMN: &str = "JOBINDEX";

/// Value columns of the job table, in order.
pub const JOB_COLUMNS: [&str; 5] = [
    "FORWARD_MODEL",
    "STARTTIME",
    "ENDTIME",
    "DURATION",
    "errorstring",
];

const TIME_FORMAT: &str = "%H:%M:%S";

/// One job line from the status file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    /// Position among parsed jobs, starting at 0
    pub index: usize,
    /// Job name
    pub name: String,
    /// Wall-clock start time
    pub start: NaiveTime,
    /// Wall-clock end time, `None` if the job never finished
    pub end: Option<NaiveTime>,
    /// Error text reported by the runner
    pub error: Option<String>,
}

impl JobRecord {
    /// Job duration in seconds.
    ///
    /// Runs crossing midnight are handled; jobs longer than 24 hours are not
    /// representable in the file and come out short.
    #[must_use]
    pub fn duration_secs(&self) -> Option<i64> {
        let end = self.end?;
        let secs = (end - self.start).num_seconds();
        Some(if secs < 0 { secs + SECONDS_PER_DAY } else { secs })
    }

    /// Whether the runner reported an error for this job.
    #[must_use]
    pub const fn failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Parse the contents of a status file.
///
/// Lines that do not look like job lines (including the header and
/// scheduler `JOBID:` lines) are skipped.
#[must_use]
pub fn parse_status(text: &str) -> Vec<JobRecord> {
    let mut jobs = Vec::new();
    for (lineno, line) in text.lines().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }
        match parse_job_line(line, jobs.len()) {
            Some(job) => jobs.push(job),
            None => warn!(line = lineno + 1, content = line, "Skipping unparseable STATUS line"),
        }
    }
    jobs
}

fn parse_job_line(line: &str, index: usize) -> Option<JobRecord> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 3 || tokens[1] != ":" {
        return None;
    }
    let start = parse_time(tokens[2])?;
    let mut rest = tokens.get(3..).unwrap_or_default();
    if rest.first() == Some(&"....") {
        rest = &rest[1..];
    }
    let end = rest.first().and_then(|t| parse_time(t));
    if end.is_some() {
        rest = &rest[1..];
    }
    let error = (!rest.is_empty()).then(|| rest.join(" "));

    Some(JobRecord {
        index,
        name: tokens[0].to_string(),
        start,
        end,
        error,
    })
}

fn parse_time(token: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(token, TIME_FORMAT).ok()
}

/// Jobs as a table: times as `HH:MM:SS` text, duration in seconds, absent
/// cells for jobs that never finished or reported no error.
///
/// # Errors
///
/// Returns error only if the table cannot be assembled
pub fn status_table(jobs: &[JobRecord]) -> Result<TimeTable> {
    let rows = jobs
        .iter()
        .map(|job| TimeRow {
            index: IndexKey::Step(i64::try_from(job.index).unwrap_or(i64::MAX)),
            values: vec![
                Some(Value::Text(job.name.clone())),
                Some(Value::Text(job.start.format(TIME_FORMAT).to_string())),
                job.end.map(|end| Value::Text(end.format(TIME_FORMAT).to_string())),
                job.duration_secs().map(Value::Integer),
                job.error.clone().map(Value::Text),
            ],
        })
        .collect();
    TimeTable::new(
        Some(JOB_INDEX_COLUMN.to_string()),
        JOB_COLUMNS.iter().map(|c| (*c).to_string()).collect(),
        rows,
    )
}

/// Read and parse a status file; `None` when it does not exist or is unreadable.
pub fn load_status(path: &Path) -> Option<Vec<JobRecord>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Some(parse_status(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read STATUS file");
            None
        }
    }
}
