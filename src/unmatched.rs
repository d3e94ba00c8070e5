use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Append-only audit logs
// ---------------------------------------------------------------------------

/// Audit trail for everything the pipeline could not settle on its own:
/// resolution misses, dropped rows, consistency warnings, structural errors.
/// Each entry is appended to a delimited log and mirrored to the text log;
/// a write failure here must never take the pipeline down with it.
pub struct UnmatchedLog {
    log_path: PathBuf,
    review_path: PathBuf,
}

pub const UNMATCHED_HEADERS: &[&str] = &["カテゴリ", "値", "備考", "記録日時"];
pub const REVIEW_HEADERS: &[&str] = &["元ファイル", "行内容", "理由", "記録日時"];

fn timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn append_row(path: &Path, headers: &[&str], row: &[&str]) -> crate::error::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let fresh = !path.exists();
    let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    let mut wtr = csv::Writer::from_writer(file);
    if fresh {
        wtr.write_record(headers)?;
    }
    wtr.write_record(row)?;
    wtr.flush()?;
    Ok(())
}

impl UnmatchedLog {
    pub fn new(dir: &Path) -> Self {
        Self {
            log_path: dir.join("unmatched.csv"),
            review_path: dir.join("review_queue.csv"),
        }
    }

    pub fn append(&self, category: &str, raw_value: &str, note: &str) {
        log::warn!("{category} | {raw_value} | {note}");
        let ts = timestamp();
        if let Err(e) = append_row(
            &self.log_path,
            UNMATCHED_HEADERS,
            &[category, raw_value, note, &ts],
        ) {
            log::error!("unmatched log write failed: {e}");
        }
    }

    /// Rows whose classification came back unknown, queued with full row
    /// context for a human pass.
    pub fn queue_review(&self, source_file: &str, row_context: &str, reason: &str) {
        log::warn!("要確認 | {source_file} | {reason}");
        let ts = timestamp();
        if let Err(e) = append_row(
            &self.review_path,
            REVIEW_HEADERS,
            &[source_file, row_context, reason, &ts],
        ) {
            log::error!("review queue write failed: {e}");
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn review_path(&self) -> &Path {
        &self.review_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = UnmatchedLog::new(dir.path());
        log.append("店舗名未正規化", "みらい文具 渋谷", "");
        log.append("日付解釈失敗", "納品済み", "ledger.csv#3");
        let content = std::fs::read_to_string(log.log_path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("カテゴリ"));
        assert!(lines[1].contains("みらい文具 渋谷"));
        assert!(lines[2].contains("日付解釈失敗"));
    }

    #[test]
    fn test_raw_value_preserved_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let log = UnmatchedLog::new(dir.path());
        log.append("企業名未正規化", "(株)ﾌｫｰﾆｰｽﾞ  東京", "");
        let mut rdr = csv::Reader::from_path(log.log_path()).unwrap();
        let record = rdr.records().next().unwrap().unwrap();
        assert_eq!(&record[1], "(株)ﾌｫｰﾆｰｽﾞ  東京");
    }

    #[test]
    fn test_review_queue_separate_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = UnmatchedLog::new(dir.path());
        log.queue_review("営業部_会社_2025年1月.xlsx", "5/3 | 謎の品 | 1000", "要分類");
        assert!(log.review_path().exists());
        assert!(!log.log_path().exists());
    }
}
