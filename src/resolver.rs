use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use unicode_normalization::UnicodeNormalization;

use crate::error::Result;
use crate::models::EntityKind;
use crate::oracle::NameOracle;
use crate::unmatched::UnmatchedLog;

// ---------------------------------------------------------------------------
// String cleanup
// ---------------------------------------------------------------------------

/// Minimal normalization applied before any lookup: NFKC, dash variants
/// unified, runs of whitespace collapsed to one ASCII space, trimmed.
pub fn clean(raw: &str) -> String {
    let nfkc: String = raw.nfkc().collect();
    let dashed = nfkc.replace(['‐', '–', '—', '―'], "-");
    dashed.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip honorific suffixes (様/殿 with optional 分) from ship-to names.
pub fn strip_honorific(name: &str) -> String {
    let mut s = name.trim();
    for suffix in ["様分", "殿分", "様", "殿", "分"] {
        if let Some(stripped) = s.strip_suffix(suffix) {
            s = stripped.trim_end();
            break;
        }
    }
    s.to_string()
}

// ---------------------------------------------------------------------------
// Token-set similarity
// ---------------------------------------------------------------------------

fn similarity_100(a: &str, b: &str) -> u32 {
    (strsim::sorensen_dice(a, b) * 100.0).round() as u32
}

/// Token-set ratio on a 0–100 scale: tokenize both sides, compare the sorted
/// intersection against each side's sorted full token string, keep the best.
/// A pure token subset scores 100. The underlying similarity is bigram-based
/// and whitespace-insensitive, so single-token Japanese names still compare
/// well against their spaced variants.
pub fn token_set_ratio(a: &str, b: &str) -> u32 {
    let ta: HashSet<&str> = a.split_whitespace().collect();
    let tb: HashSet<&str> = b.split_whitespace().collect();
    if ta.is_empty() || tb.is_empty() {
        return 0;
    }

    let mut inter: Vec<&str> = ta.intersection(&tb).copied().collect();
    let mut only_a: Vec<&str> = ta.difference(&tb).copied().collect();
    let mut only_b: Vec<&str> = tb.difference(&ta).copied().collect();
    inter.sort_unstable();
    only_a.sort_unstable();
    only_b.sort_unstable();

    let base = inter.join(" ");
    let combined_a = join_parts(&base, &only_a.join(" "));
    let combined_b = join_parts(&base, &only_b.join(" "));

    similarity_100(&base, &combined_a)
        .max(similarity_100(&base, &combined_b))
        .max(similarity_100(&combined_a, &combined_b))
}

fn join_parts(base: &str, rest: &str) -> String {
    match (base.is_empty(), rest.is_empty()) {
        (true, _) => rest.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{base} {rest}"),
    }
}

// ---------------------------------------------------------------------------
// Entity dictionary
// ---------------------------------------------------------------------------

const DICT_FILE: &str = "entity_dict.csv";
const MANUAL_DICT_FILE: &str = "entity_dict_manual.csv";
const DICT_HEADERS: &[&str] = &["表記", "標準化", "種別", "登録日時"];

/// Persistent raw→canonical mapping, partitioned by entity kind. Backed by
/// an append-only delimited file: fully loaded at startup, appended on each
/// confirmed mapping, never rewritten. A manual seed file alongside is read
/// but never written.
pub struct EntityDictionary {
    auto_path: PathBuf,
    maps: HashMap<EntityKind, HashMap<String, String>>,
    // Insertion order per kind; fuzzy ties resolve to the earliest key.
    order: HashMap<EntityKind, Vec<String>>,
}

impl EntityDictionary {
    pub fn load(dict_dir: &Path) -> Result<Self> {
        let mut dict = Self {
            auto_path: dict_dir.join(DICT_FILE),
            maps: HashMap::new(),
            order: HashMap::new(),
        };
        let manual = dict_dir.join(MANUAL_DICT_FILE);
        if manual.exists() {
            dict.load_file(&manual)?;
        }
        if dict.auto_path.exists() {
            let path = dict.auto_path.clone();
            dict.load_file(&path)?;
        }
        Ok(dict)
    }

    fn load_file(&mut self, path: &Path) -> Result<()> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)?;
        for result in rdr.records() {
            let record = result?;
            if record.len() < 3 {
                continue;
            }
            let Some(kind) = EntityKind::from_key(record[2].trim()) else {
                continue;
            };
            self.remember(kind, record[0].to_string(), record[1].to_string());
        }
        Ok(())
    }

    fn remember(&mut self, kind: EntityKind, raw: String, canonical: String) {
        let map = self.maps.entry(kind).or_default();
        if map.contains_key(&raw) {
            return; // append-only: the first mapping for a key wins
        }
        map.insert(raw.clone(), canonical);
        self.order.entry(kind).or_default().push(raw);
    }

    pub fn get(&self, kind: EntityKind, key: &str) -> Option<&str> {
        self.maps.get(&kind)?.get(key).map(String::as_str)
    }

    pub fn keys(&self, kind: EntityKind) -> &[String] {
        self.order.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self, kind: EntityKind) -> usize {
        self.maps.get(&kind).map(HashMap::len).unwrap_or(0)
    }

    /// Record a confirmed mapping: in memory and appended to the store.
    pub fn insert(&mut self, kind: EntityKind, raw: &str, canonical: &str) -> Result<()> {
        if self.get(kind, raw).is_some() {
            return Ok(());
        }
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
        wtr.write_record([raw, canonical, kind.key(), &ts])?;
        wtr.flush()?;
        self.remember(kind, raw.to_string(), canonical.to_string());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Resolver cascade
// ---------------------------------------------------------------------------

const FUZZY_THRESHOLD: u32 = 90;

/// Oracle answers meaning "I don't know" that must not become canon.
const PLACEHOLDER_ANSWERS: &[&str] = &["不明", "なし", "none", "unknown", "n/a"];

pub struct EntityResolver {
    dict: EntityDictionary,
}

impl EntityResolver {
    pub fn new(dict: EntityDictionary) -> Self {
        Self { dict }
    }

    pub fn dictionary(&self) -> &EntityDictionary {
        &self.dict
    }

    /// Resolve a raw name to its canonical form. When every tier misses,
    /// the cleaned input comes back unchanged and one audit entry is
    /// written; resolution never blocks the pipeline.
    pub fn resolve(
        &mut self,
        raw: &str,
        kind: EntityKind,
        oracle: &dyn NameOracle,
        unmatched: &UnmatchedLog,
    ) -> String {
        let cleaned = clean(raw);
        if cleaned.is_empty() {
            return cleaned;
        }

        // 1. Exact dictionary hit
        if let Some(canonical) = self.dict.get(kind, &cleaned) {
            return canonical.to_string();
        }

        // 2. Fuzzy match over existing keys; earliest key wins ties
        let mut best: Option<(&String, u32)> = None;
        for key in self.dict.keys(kind) {
            let score = token_set_ratio(&cleaned, key);
            if score >= FUZZY_THRESHOLD && best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((key, score));
            }
        }
        if let Some((key, _)) = best {
            if let Some(canonical) = self.dict.get(kind, &key.clone()) {
                return canonical.to_string();
            }
        }

        // 3. Oracle, validated before it becomes canon
        if let Some(answer) = oracle.suggest(kind, &cleaned) {
            let answer = answer.trim().to_string();
            if accept_completion(&cleaned, &answer) {
                if let Err(e) = self.dict.insert(kind, &cleaned, &answer) {
                    log::error!("dictionary append failed: {e}");
                }
                return answer;
            }
        }

        // 4. Best-effort fallback: the cleaned input, audited
        unmatched.append(&format!("{}未正規化", kind.label()), raw, "");
        cleaned
    }
}

/// An oracle answer is usable only if it is non-empty, not a placeholder for
/// "unknown", and actually different from the input.
fn accept_completion(cleaned: &str, answer: &str) -> bool {
    if answer.is_empty() {
        return false;
    }
    let lower = answer.to_lowercase();
    if PLACEHOLDER_ANSWERS.iter().any(|p| lower == *p) {
        return false;
    }
    if lower == cleaned.to_lowercase() {
        return false;
    }
    true
}
