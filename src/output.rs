use std::io::{self, Write};

use serde::Serialize;
use serde_json::Value;

use crate::app::{CancelReport, ListResult, StatusReport};
use crate::reconcile::SweepReport;
use crate::submit::SubmissionReport;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_submission(result: &SubmissionReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &StatusReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_cancel(result: &CancelReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_sweep(result: &SweepReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_entity(result: &Value) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
