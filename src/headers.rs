use std::collections::HashMap;

use unicode_normalization::UnicodeNormalization;

use crate::error::{LedgerError, Result};
use crate::models::CanonicalField;

// ---------------------------------------------------------------------------
// Alias table
// ---------------------------------------------------------------------------

/// Enumeration order doubles as match priority: a header claims the first
/// canonical field whose alias it contains.
const FIELD_ALIASES: &[(CanonicalField, &[&str])] = &[
    (CanonicalField::Department, &["部署", "部門"]),
    (CanonicalField::Client, &["ご依頼主", "依頼主", "得意先", "取引先"]),
    (
        CanonicalField::Date,
        &["日付", "納品日", "売上日", "作業日", "配達完了", "訪問日", "出荷日"],
    ),
    (CanonicalField::Company, &["企業名", "企業", "会社名", "支払先"]),
    (
        CanonicalField::Store,
        &["店舗名", "店舗", "納品先", "送り先", "発送先", "お届け先", "お客様名", "お客様"],
    ),
    (
        CanonicalField::ItemOrService,
        &["作業内容", "サービス項目", "作業項目", "商品名", "商品", "品名", "品目", "内容"],
    ),
    (CanonicalField::Quantity, &["数量", "個数", "本数"]),
    (CanonicalField::UnitPrice, &["単価", "価格", "値段"]),
    (CanonicalField::Amount, &["金額", "小計"]),
];

/// Keyword list for the amount column, applied independently of the alias
/// table and unioned with its result.
const AMOUNT_KEYWORDS: &[&str] = &[
    "金額", "売上", "請求", "支払", "原価", "仕入", "コスト", "実績", "合計", "総額", "小計",
];

/// Cost-morpheme suffixes: 作業費, 部品代, 送料 and friends.
const AMOUNT_SUFFIXES: &[char] = &['費', '代', '料'];

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Canonical composition, all whitespace (ASCII and U+3000) and line breaks
/// stripped, lowercased.
pub fn normalize_header(raw: &str) -> String {
    raw.nfkc()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
}

fn first_matching_field(normalized: &str) -> Option<CanonicalField> {
    for (field, aliases) in FIELD_ALIASES {
        for alias in *aliases {
            if normalized.contains(&normalize_header(alias)) {
                return Some(*field);
            }
        }
    }
    None
}

fn looks_like_amount(normalized: &str) -> bool {
    if AMOUNT_KEYWORDS
        .iter()
        .any(|kw| normalized.contains(&normalize_header(kw)))
    {
        return true;
    }
    normalized
        .chars()
        .last()
        .map(|c| AMOUNT_SUFFIXES.contains(&c))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Header map
// ---------------------------------------------------------------------------

/// Per-file mapping from column position to canonical field, plus the
/// unresolved extra columns kept by index for pass-through use.
#[derive(Debug, Clone)]
pub struct HeaderMap {
    fields: HashMap<CanonicalField, usize>,
    raw: HashMap<CanonicalField, String>,
    extras: Vec<(usize, String)>,
}

impl HeaderMap {
    pub fn column(&self, field: CanonicalField) -> Option<usize> {
        self.fields.get(&field).copied()
    }

    /// The original header text that claimed a field (for kind hints).
    pub fn raw_header(&self, field: CanonicalField) -> Option<&str> {
        self.raw.get(&field).map(String::as_str)
    }

    pub fn extras(&self) -> &[(usize, String)] {
        &self.extras
    }
}

/// Map raw headers to canonical fields. Each header maps to at most one
/// field (first alias match wins) and each field keeps its first matching
/// header. A file with no amount column is structurally invalid.
pub fn map_headers(headers: &[String], source: &str) -> Result<HeaderMap> {
    let mut fields: HashMap<CanonicalField, usize> = HashMap::new();
    let mut raw: HashMap<CanonicalField, String> = HashMap::new();
    let mut extras: Vec<(usize, String)> = Vec::new();

    for (idx, header) in headers.iter().enumerate() {
        let normalized = normalize_header(header);
        if normalized.is_empty() {
            continue;
        }
        match first_matching_field(&normalized) {
            Some(field) if !fields.contains_key(&field) => {
                fields.insert(field, idx);
                raw.insert(field, header.clone());
            }
            _ => extras.push((idx, header.clone())),
        }
    }

    // Amount fallback: keyword list + cost-morpheme suffix over the columns
    // the alias pass left unclaimed.
    if !fields.contains_key(&CanonicalField::Amount) {
        let claimed: Vec<usize> = fields.values().copied().collect();
        for (idx, header) in headers.iter().enumerate() {
            if claimed.contains(&idx) {
                continue;
            }
            let normalized = normalize_header(header);
            if !normalized.is_empty() && looks_like_amount(&normalized) {
                fields.insert(CanonicalField::Amount, idx);
                raw.insert(CanonicalField::Amount, header.clone());
                extras.retain(|(i, _)| *i != idx);
                break;
            }
        }
    }

    if !fields.contains_key(&CanonicalField::Amount) {
        return Err(LedgerError::MissingAmountColumn(source.to_string()));
    }

    Ok(HeaderMap {
        fields,
        raw,
        extras,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_normalize_header() {
        assert_eq!(normalize_header("　納品日\n"), "納品日");
        assert_eq!(normalize_header("ＡＢＣ Corp"), "abccorp");
        assert_eq!(normalize_header("単価（税込）"), "単価(税込)");
    }

    #[test]
    fn test_basic_mapping() {
        let map = map_headers(
            &headers(&["納品日", "お届け先", "商品名", "数量", "単価", "金額"]),
            "t.csv",
        )
        .unwrap();
        assert_eq!(map.column(CanonicalField::Date), Some(0));
        assert_eq!(map.column(CanonicalField::Store), Some(1));
        assert_eq!(map.column(CanonicalField::ItemOrService), Some(2));
        assert_eq!(map.column(CanonicalField::Quantity), Some(3));
        assert_eq!(map.column(CanonicalField::UnitPrice), Some(4));
        assert_eq!(map.column(CanonicalField::Amount), Some(5));
        assert!(map.extras().is_empty());
    }

    #[test]
    fn test_idempotent_on_canonical_headers() {
        let canonical = headers(&[
            "部署", "ご依頼主", "日付", "企業名", "店舗名", "品目", "数量", "単価", "金額",
        ]);
        let map = map_headers(&canonical, "t.csv").unwrap();
        for (idx, field) in [
            CanonicalField::Department,
            CanonicalField::Client,
            CanonicalField::Date,
            CanonicalField::Company,
            CanonicalField::Store,
            CanonicalField::ItemOrService,
            CanonicalField::Quantity,
            CanonicalField::UnitPrice,
            CanonicalField::Amount,
        ]
        .into_iter()
        .enumerate()
        {
            assert_eq!(map.column(field), Some(idx), "field {field:?}");
        }
    }

    #[test]
    fn test_first_header_per_canonical_wins() {
        let map = map_headers(&headers(&["金額", "合計金額", "日付"]), "t.csv").unwrap();
        assert_eq!(map.column(CanonicalField::Amount), Some(0));
        assert_eq!(map.extras().len(), 1);
        assert_eq!(map.extras()[0].1, "合計金額");
    }

    #[test]
    fn test_amount_keyword_fallback() {
        let map = map_headers(&headers(&["日付", "品名", "ご請求金額"]), "t.csv").unwrap();
        assert_eq!(map.column(CanonicalField::Amount), Some(2));
    }

    #[test]
    fn test_amount_suffix_fallback() {
        let map = map_headers(&headers(&["日付", "品名", "作業費"]), "t.csv").unwrap();
        assert_eq!(map.column(CanonicalField::Amount), Some(2));
    }

    #[test]
    fn test_missing_amount_is_structural() {
        let err = map_headers(&headers(&["日付", "品名", "数量"]), "t.csv").unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn test_date_alias_not_hijacked_by_amount_keywords() {
        // 売上日 contains the amount keyword 売上 but is a date alias
        let map = map_headers(&headers(&["売上日", "品名", "売上金額"]), "t.csv").unwrap();
        assert_eq!(map.column(CanonicalField::Date), Some(0));
        assert_eq!(map.column(CanonicalField::Amount), Some(2));
    }

    #[test]
    fn test_identifier_columns_land_in_extras() {
        let map = map_headers(
            &headers(&["日付", "金額", "伝票番号", "注文番号"]),
            "t.csv",
        )
        .unwrap();
        assert_eq!(map.extras().len(), 2);
    }
}
