use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::classify::Classifier;
use crate::error::{LedgerError, Result};
use crate::extract::{extract_table, ExtractContext};
use crate::headers::map_headers;
use crate::models::{parse_filename, CanonicalRecord, FileMeta, ALL_ENTITY_KINDS};
use crate::oracle::{ChatOracle, NameOracle, NullOracle};
use crate::report;
use crate::resolver::{EntityDictionary, EntityResolver};
use crate::settings::Settings;
use crate::sheet;
use crate::unmatched::UnmatchedLog;

pub const VALID_EXTENSIONS: &[&str] = &["xlsx", "xls", "csv"];

pub fn is_ledger_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with("~$") {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VALID_EXTENSIONS.iter().any(|v| e.eq_ignore_ascii_case(v)))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Everything one file pass needs: the dictionaries, the oracle and the
/// audit log, wired once at startup and shared across files in walk order.
pub struct Pipeline {
    settings: Settings,
    resolver: EntityResolver,
    classifier: Classifier,
    oracle: Box<dyn NameOracle>,
    log: UnmatchedLog,
}

impl Pipeline {
    pub fn new(settings: Settings) -> Result<Self> {
        let oracle: Box<dyn NameOracle> = match ChatOracle::from_settings(&settings) {
            Some(oracle) => Box::new(oracle),
            None => {
                log::info!("name-resolution oracle disabled: no API key configured");
                Box::new(NullOracle)
            }
        };
        Self::with_oracle(settings, oracle)
    }

    pub fn with_oracle(settings: Settings, oracle: Box<dyn NameOracle>) -> Result<Self> {
        settings.ensure_dirs()?;
        let resolver = EntityResolver::new(EntityDictionary::load(&settings.dict_dir())?);
        let classifier = Classifier::load(&settings.dict_dir())?;
        let log = UnmatchedLog::new(&settings.output_dir());
        let loaded: usize = ALL_ENTITY_KINDS
            .iter()
            .map(|kind| resolver.dictionary().len(*kind))
            .sum();
        log::info!(
            "entity dictionary loaded: {loaded} mappings; audit log {} / review queue {}",
            log.log_path().display(),
            log.review_path().display()
        );
        Ok(Self {
            settings,
            resolver,
            classifier,
            oracle,
            log,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run one file through the pipeline. The whole (department, period)
    /// group is recomputed from every file still present in the watch and
    /// archive trees, and the group's artifacts are fully replaced.
    ///
    /// Errors returned here abort the triggering file (structural / IO);
    /// defects in sibling files only log and skip that sibling.
    pub fn process_file(&mut self, path: &Path) -> Result<usize> {
        let meta = parse_filename(path).ok_or_else(|| {
            self.log.append(
                "ファイル名不正",
                &path.to_string_lossy(),
                "部署_企業_YYYY年M月 形式ではありません",
            );
            LedgerError::InvalidFilename(path.to_string_lossy().to_string())
        })?;

        log::info!(
            "processing {} (dept={} period={})",
            path.display(),
            meta.department,
            meta.period()
        );

        let mut records: Vec<CanonicalRecord> = Vec::new();
        for file in self.collect_group(path, &meta) {
            if file == path {
                records.extend(self.extract_file(&file)?);
            } else {
                match self.extract_file(&file) {
                    Ok(found) => records.extend(found),
                    Err(e) => {
                        self.log
                            .append("読込エラー", &file.to_string_lossy(), &e.to_string());
                    }
                }
            }
        }

        let out_root = self.settings.output_dir();
        report::write_group(&out_root, &meta.department, &meta.period(), &records)?;
        report::touch_last_updated(&out_root)?;
        log::info!(
            "group {} {} rebuilt: {} records",
            meta.department,
            meta.period(),
            records.len()
        );
        Ok(records.len())
    }

    fn extract_file(&mut self, path: &Path) -> Result<Vec<CanonicalRecord>> {
        let meta = parse_filename(path)
            .ok_or_else(|| LedgerError::InvalidFilename(path.to_string_lossy().to_string()))?;
        let source = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let tables = sheet::read_tables(path)?;
        if tables.is_empty() {
            return Err(LedgerError::MissingAmountColumn(source));
        }

        let mut records = Vec::new();
        let mut first_err: Option<LedgerError> = None;
        let mut mapped_any = false;
        for table in &tables {
            match map_headers(&table.headers, &source) {
                Ok(map) => {
                    mapped_any = true;
                    let mut ctx = ExtractContext {
                        resolver: &mut self.resolver,
                        classifier: &mut self.classifier,
                        oracle: self.oracle.as_ref(),
                        log: &self.log,
                    };
                    records.extend(extract_table(table, &map, &meta, &source, &mut ctx));
                }
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        // A sheet without an amount column is skipped; a file where no sheet
        // has one is structurally invalid.
        match (mapped_any, first_err) {
            (false, Some(e)) => Err(e),
            (true, Some(_)) => {
                self.log
                    .append("列不足", &source, "金額列のないシートを無視しました");
                Ok(records)
            }
            _ => Ok(records),
        }
    }

    /// All files for the same (department, period), across the watch tree
    /// (excluding generated subtrees) and the success archive, sorted for a
    /// deterministic recompute order.
    fn collect_group(&self, trigger: &Path, meta: &FileMeta) -> Vec<PathBuf> {
        let output_dir = self.settings.output_dir();
        let error_dir = self.settings.error_dir();
        let mut group: Vec<PathBuf> = Vec::new();

        for root in [self.settings.watch_dir(), self.settings.archive_dir()] {
            for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
                let path = entry.path();
                if !entry.file_type().is_file()
                    || path.starts_with(&output_dir)
                    || path.starts_with(&error_dir)
                    || !is_ledger_file(path)
                {
                    continue;
                }
                match parse_filename(path) {
                    Some(m) if m.department == meta.department && m.period() == meta.period() => {
                        group.push(path.to_path_buf());
                    }
                    _ => {}
                }
            }
        }

        if !group.iter().any(|p| p.as_path() == trigger) {
            group.push(trigger.to_path_buf());
        }
        group.sort();
        group.dedup();
        group
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings(root: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.watch_dir = root.to_string_lossy().to_string();
        settings
    }

    fn write_ledger(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_is_ledger_file() {
        assert!(is_ledger_file(Path::new("営業部_会社_2025年1月.xlsx")));
        assert!(is_ledger_file(Path::new("a.CSV")));
        assert!(!is_ledger_file(Path::new("~$営業部_会社_2025年1月.xlsx")));
        assert!(!is_ledger_file(Path::new("memo.txt")));
    }

    #[test]
    fn test_invalid_filename_yields_zero_records() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let mut pipeline =
            Pipeline::with_oracle(settings.clone(), Box::new(NullOracle)).unwrap();
        let path = write_ledger(dir.path(), "売上メモ.csv", "日付,金額\n5/3,100\n");
        let err = pipeline.process_file(&path).unwrap_err();
        assert!(err.is_structural());
        // No group artifact was written
        assert!(!settings.output_dir().join("売上メモ").exists());
    }

    #[test]
    fn test_missing_amount_column_is_structural() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let mut pipeline = Pipeline::with_oracle(settings, Box::new(NullOracle)).unwrap();
        let path = write_ledger(
            dir.path(),
            "営業部_株式会社Forneeds_2025年1月.csv",
            "日付,品名,数量\n5/3,ロール紙,2\n",
        );
        let err = pipeline.process_file(&path).unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn test_process_file_writes_group_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let mut pipeline =
            Pipeline::with_oracle(settings.clone(), Box::new(NullOracle)).unwrap();
        let path = write_ledger(
            dir.path(),
            "営業部_株式会社Forneeds_2025年1月.csv",
            "納品日,店舗名,品名,数量,単価,金額\n5月3日,みらい文具渋谷店,ロール紙,2,500,1000\n",
        );
        let count = pipeline.process_file(&path).unwrap();
        assert_eq!(count, 1);

        let csv_path = settings
            .output_dir()
            .join("営業部")
            .join("営業部_2025-01_records.csv");
        let content = std::fs::read_to_string(csv_path).unwrap();
        assert!(content.contains("2025/05/03"));
        assert!(content.contains("みらい文具渋谷店"));
        assert!(report::read_last_updated(&settings.output_dir()).is_some());
    }

    #[test]
    fn test_group_recompute_spans_watch_and_archive() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        settings.ensure_dirs().unwrap();
        // An already-archived file from the same department and period
        let archived_dir = settings.archive_dir().join("営業部");
        std::fs::create_dir_all(&archived_dir).unwrap();
        write_ledger(
            &archived_dir,
            "営業部_株式会社Forneeds_2025年1月分前半.csv",
            "納品日,品名,金額\n5/1,ロール紙,700\n",
        );
        let mut pipeline =
            Pipeline::with_oracle(settings.clone(), Box::new(NullOracle)).unwrap();
        let path = write_ledger(
            dir.path(),
            "営業部_株式会社Forneeds_2025年1月.csv",
            "納品日,品名,金額\n5/3,ロール紙,300\n",
        );
        let count = pipeline.process_file(&path).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_two_spellings_group_under_one_canonical_name() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        settings.ensure_dirs().unwrap();
        // Seed the dictionary with the canonical spelling
        std::fs::write(
            settings.dict_dir().join("entity_dict_manual.csv"),
            "表記,標準化,種別,登録日時\nみらい文具 渋谷店,みらい文具渋谷店,store,\n",
        )
        .unwrap();

        let mut pipeline =
            Pipeline::with_oracle(settings.clone(), Box::new(NullOracle)).unwrap();

        // Two files, same period and department, store spelled two ways that
        // resolve (exact / fuzzy) to the same canonical form
        write_ledger(
            dir.path(),
            "営業部_株式会社Forneeds_2025年1月前半.csv",
            "納品日,店舗名,品名,金額\n5/1,みらい文具 渋谷店,ロール紙,700\n",
        );
        let second = write_ledger(
            dir.path(),
            "営業部_株式会社Forneeds_2025年1月後半.csv",
            "納品日,店舗名,品名,金額\n5/3,みらい文具 渋谷,ロール紙,300\n",
        );
        pipeline.process_file(&second).unwrap();
        report::merge_all(&settings.output_dir()).unwrap();

        let summary = std::fs::read_to_string(
            settings
                .output_dir()
                .join("_company")
                .join("company_records.csv"),
        )
        .unwrap();
        let canonical_rows = summary
            .lines()
            .filter(|l| l.contains("みらい文具渋谷店"))
            .count();
        assert_eq!(canonical_rows, 2);

        let records = std::fs::read_to_string(
            settings
                .output_dir()
                .join("営業部")
                .join("営業部_2025-01_records.csv"),
        )
        .unwrap();
        assert_eq!(records.matches("みらい文具渋谷店").count(), 2);
    }
}
