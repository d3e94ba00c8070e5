use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::models::Classification;
use crate::oracle::NameOracle;

// ---------------------------------------------------------------------------
// Keyword lists
// ---------------------------------------------------------------------------

const SERVICE_KEYWORDS: &[&str] = &[
    "設置", "設定", "保守", "対応", "サポート", "レクチャー", "納品書", "運賃",
];

const PRODUCT_KEYWORDS: &[&str] = &["ロール紙", "プリンター", "ケーブル", "OAタップ", "端末"];

// ---------------------------------------------------------------------------
// Dictionaries
// ---------------------------------------------------------------------------

const MANUAL_FILE: &str = "classification_manual.csv";
const AUTO_FILE: &str = "classification_auto.csv";
const DICT_HEADERS: &[&str] = &["表記", "分類", "登録日時"];

fn load_map(path: &Path) -> Result<HashMap<String, Classification>> {
    let mut map = HashMap::new();
    if !path.exists() {
        return Ok(map);
    }
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    for result in rdr.records() {
        let record = result?;
        if record.len() < 2 {
            continue;
        }
        if let Some(class) = Classification::from_label(record[1].trim()) {
            map.entry(record[0].to_string()).or_insert(class);
        }
    }
    Ok(map)
}

// ---------------------------------------------------------------------------
// Classifier cascade
// ---------------------------------------------------------------------------

/// Item/service classification: manual dictionary → auto-learned dictionary
/// → keyword lists → oracle constrained to a single token. Oracle answers
/// are learned into the auto dictionary; unknowns are the caller's problem
/// (they go to the review queue with the whole row attached).
pub struct Classifier {
    manual: HashMap<String, Classification>,
    auto: HashMap<String, Classification>,
    auto_path: PathBuf,
}

impl Classifier {
    pub fn load(dict_dir: &Path) -> Result<Self> {
        Ok(Self {
            manual: load_map(&dict_dir.join(MANUAL_FILE))?,
            auto: load_map(&dict_dir.join(AUTO_FILE))?,
            auto_path: dict_dir.join(AUTO_FILE),
        })
    }

    pub fn classify(&mut self, text: &str, oracle: &dyn NameOracle) -> Classification {
        let text = text.trim();
        if text.is_empty() {
            return Classification::Unknown;
        }

        if let Some(&class) = self.manual.get(text) {
            return class;
        }
        if let Some(&class) = self.auto.get(text) {
            return class;
        }

        if SERVICE_KEYWORDS.iter().any(|kw| text.contains(kw)) {
            return Classification::Service;
        }
        if PRODUCT_KEYWORDS.iter().any(|kw| text.contains(kw)) {
            return Classification::Product;
        }

        if let Some(answer) = oracle.classify_item(text) {
            // Token scan: the model sometimes wraps the answer in a sentence
            for (token, class) in [
                ("商品", Classification::Product),
                ("作業", Classification::Service),
                ("不明", Classification::Unknown),
            ] {
                if answer.contains(token) {
                    if class != Classification::Unknown {
                        self.learn(text, class);
                    }
                    return class;
                }
            }
        }

        Classification::Unknown
    }

    fn learn(&mut self, text: &str, class: Classification) {
        self.auto.insert(text.to_string(), class);
        if let Err(e) = self.append(text, class) {
            log::error!("classification dictionary append failed: {e}");
        }
    }

    fn append(&self, text: &str, class: Classification) -> Result<()> {
        if let Some(parent) = self.auto_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let fresh = !self.auto_path.exists();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.auto_path)?;
        let mut wtr = csv::Writer::from_writer(file);
        if fresh {
            wtr.write_record(DICT_HEADERS)?;
        }
        let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        wtr.write_record([text, class.label(), &ts])?;
        wtr.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::testing::FakeOracle;
    use crate::oracle::NullOracle;

    #[test]
    fn test_service_keywords() {
        let dir = tempfile::tempdir().unwrap();
        let mut classifier = Classifier::load(dir.path()).unwrap();
        assert_eq!(
            classifier.classify("プリンター設置作業", &NullOracle),
            Classification::Service
        );
        assert_eq!(
            classifier.classify("レジ保守契約", &NullOracle),
            Classification::Service
        );
    }

    #[test]
    fn test_product_keywords() {
        let dir = tempfile::tempdir().unwrap();
        let mut classifier = Classifier::load(dir.path()).unwrap();
        assert_eq!(
            classifier.classify("感熱ロール紙 80mm", &NullOracle),
            Classification::Product
        );
    }

    #[test]
    fn test_manual_dictionary_wins_over_keywords() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANUAL_FILE),
            "表記,分類,登録日時\nプリンター設置作業,商品,\n",
        )
        .unwrap();
        let mut classifier = Classifier::load(dir.path()).unwrap();
        assert_eq!(
            classifier.classify("プリンター設置作業", &NullOracle),
            Classification::Product
        );
    }

    #[test]
    fn test_oracle_answer_learned() {
        let dir = tempfile::tempdir().unwrap();
        let mut classifier = Classifier::load(dir.path()).unwrap();
        let oracle = FakeOracle::with_classifications(vec![Some("商品".to_string())]);
        assert_eq!(
            classifier.classify("謎の品目", &oracle),
            Classification::Product
        );
        // Learned into the auto dictionary, no second oracle call
        assert_eq!(
            classifier.classify("謎の品目", &oracle),
            Classification::Product
        );
        assert_eq!(*oracle.classify_calls.borrow(), 1);

        let reloaded = Classifier::load(dir.path()).unwrap();
        assert_eq!(reloaded.auto.get("謎の品目"), Some(&Classification::Product));
    }

    #[test]
    fn test_unknown_not_learned() {
        let dir = tempfile::tempdir().unwrap();
        let mut classifier = Classifier::load(dir.path()).unwrap();
        let oracle = FakeOracle::with_classifications(vec![Some("不明".to_string())]);
        assert_eq!(
            classifier.classify("謎の品目", &oracle),
            Classification::Unknown
        );
        assert!(!dir.path().join(AUTO_FILE).exists());
    }

    #[test]
    fn test_no_oracle_falls_to_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let mut classifier = Classifier::load(dir.path()).unwrap();
        assert_eq!(
            classifier.classify("謎の品目", &NullOracle),
            Classification::Unknown
        );
    }
}
