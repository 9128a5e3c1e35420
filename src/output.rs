use std::io::{self, Write};

use serde::Serialize;

use crate::pipeline::{CacheStatus, CachedStudy, ClearReport, SweepReport};

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_status(status: &CacheStatus) -> io::Result<()> {
        Self::print_json(status)
    }

    pub fn print_studies(studies: &[CachedStudy]) -> io::Result<()> {
        Self::print_json(&studies)
    }

    pub fn print_clear(report: &ClearReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_sweep(report: &SweepReport) -> io::Result<()> {
        Self::print_json(&SweepSummary::from(report))
    }

    pub fn print_json<T: Serialize + ?Sized>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

#[derive(Serialize)]
struct SweepSummary<'a> {
    examined: usize,
    finish_queued: Vec<&'a str>,
    resubmit: usize,
    stale: usize,
    running: usize,
    failures: usize,
}

impl<'a> From<&'a SweepReport> for SweepSummary<'a> {
    fn from(report: &'a SweepReport) -> Self {
        Self {
            examined: report.examined,
            finish_queued: report
                .finish
                .iter()
                .map(|request| request.repertoire_cache_uuid.as_str())
                .collect(),
            resubmit: report.resubmit,
            stale: report.stale,
            running: report.running,
            failures: report.failures,
        }
    }
}
