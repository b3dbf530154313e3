use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One failed file with every error detail recorded for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedFile {
    pub path: String,
    pub errors: Vec<String>,
}

/// Aggregate result of one run, from queue non-empty to queue drain with no
/// outstanding workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    /// Files processed, pass or fail.
    pub scanned: usize,
    pub elapsed_seconds: f64,
    /// Passed paths, sorted.
    pub passed: Vec<String>,
    /// Failed files, sorted by path.
    pub failed: Vec<FailedFile>,
}

impl Report {
    pub(crate) fn from_run(
        mut passed: Vec<String>,
        failed: BTreeMap<String, Vec<String>>,
        scanned: usize,
        elapsed: Duration,
    ) -> Self {
        passed.sort();
        let failed = failed
            .into_iter()
            .map(|(path, errors)| FailedFile { path, errors })
            .collect();
        Report {
            scanned,
            elapsed_seconds: if scanned > 0 { elapsed.as_secs_f64() } else { 0.0 },
            passed,
            failed,
        }
    }

    /// The one-line run summary.
    pub fn summary(&self) -> String {
        format!(
            "{} {} scanned in {:.2} seconds",
            self.scanned,
            file_noun(self.scanned),
            self.elapsed_seconds
        )
    }

    /// The full final-report text: summary, failed files with their error
    /// details, passed files.
    pub fn to_text(&self) -> String {
        let mut out = String::from("[Final Report]\n---\n");
        out.push_str(&self.summary());
        out.push('\n');

        out.push_str(&format!(
            "---\n{} {} ERRORED\n",
            self.failed.len(),
            file_noun(self.failed.len())
        ));
        for file in &self.failed {
            out.push_str(&file.path);
            out.push('\n');
            for error in &file.errors {
                out.push_str("    ");
                out.push_str(error);
                out.push('\n');
            }
        }

        out.push_str(&format!(
            "---\n{} {} PASSED\n",
            self.passed.len(),
            file_noun(self.passed.len())
        ));
        for path in &self.passed {
            out.push_str(path);
            out.push('\n');
        }
        out
    }
}

fn file_noun(n: usize) -> &'static str {
    if n == 1 {
        "file"
    } else {
        "files"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> Report {
        let mut failed = BTreeMap::new();
        failed.insert(
            "/music/b.mp3".to_string(),
            vec!["CRC_MISMATCH @ 0m 13s".to_string()],
        );
        Report::from_run(
            vec!["/music/z.flac".to_string(), "/music/a.flac".to_string()],
            failed,
            3,
            Duration::from_millis(1530),
        )
    }

    #[test]
    fn summary_line() {
        let report = sample_report();
        assert_eq!(report.summary(), "3 files scanned in 1.53 seconds");

        let single = Report::from_run(vec!["x".into()], BTreeMap::new(), 1, Duration::from_secs(2));
        assert_eq!(single.summary(), "1 file scanned in 2.00 seconds");
    }

    #[test]
    fn zero_scanned_reports_zero_elapsed() {
        let report = Report::from_run(Vec::new(), BTreeMap::new(), 0, Duration::from_secs(9));
        assert_eq!(report.summary(), "0 files scanned in 0.00 seconds");
    }

    #[test]
    fn passed_list_is_sorted() {
        let report = sample_report();
        assert_eq!(report.passed, vec!["/music/a.flac", "/music/z.flac"]);
    }

    #[test]
    fn text_layout() {
        let text = sample_report().to_text();
        assert!(text.starts_with("[Final Report]\n---\n3 files scanned"));
        assert!(text.contains("1 file ERRORED\n/music/b.mp3\n    CRC_MISMATCH @ 0m 13s\n"));
        assert!(text.contains("2 files PASSED\n/music/a.flac\n/music/z.flac\n"));
    }

    #[test]
    fn json_roundtrip() {
        let report = sample_report();
        let json = serde_json::to_string_pretty(&report).unwrap();
        let parsed: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.scanned, 3);
        assert_eq!(parsed.failed.len(), 1);
        assert_eq!(parsed.failed[0].errors[0], "CRC_MISMATCH @ 0m 13s");
    }
}
