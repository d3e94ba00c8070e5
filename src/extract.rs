use crate::classify::Classifier;
use crate::dates;
use crate::headers::HeaderMap;
use crate::models::{
    CanonicalField, CanonicalRecord, Classification, EntityKind, FileMeta, RawTable,
};
use crate::oracle::NameOracle;
use crate::resolver::{strip_honorific, EntityResolver};
use crate::unmatched::UnmatchedLog;

// ---------------------------------------------------------------------------
// Cell parsing helpers
// ---------------------------------------------------------------------------

/// Strict number parse for the amount column: currency symbols, thousands
/// separators and parenthesized negatives accepted, anything else is None.
pub fn parse_number(raw: &str) -> Option<f64> {
    let s = raw
        .replace(',', "")
        .replace('"', "")
        .replace('¥', "")
        .replace('$', "")
        .replace('円', "");
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(inner) = s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        return inner.trim().parse::<f64>().ok().map(|v| -v);
    }
    s.parse().ok()
}

/// Voucher/order numbers exported as floats come back as plain integers.
pub fn normalize_identifier(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.parse::<f64>() {
        Ok(v) if v.fract() == 0.0 => format!("{}", v as i64),
        _ => trimmed.to_string(),
    }
}

/// Relative tolerance for the quantity × unit price sanity check.
const CONSISTENCY_TOLERANCE: f64 = 0.01;

fn consistency_mismatch(quantity: f64, unit_price: f64, amount: f64) -> bool {
    let expected = quantity * unit_price;
    let diff = (expected - amount).abs();
    if amount.abs() > f64::EPSILON {
        diff / amount.abs() > CONSISTENCY_TOLERANCE
    } else {
        diff > f64::EPSILON
    }
}

// ---------------------------------------------------------------------------
// Entity column selection
// ---------------------------------------------------------------------------

/// The dictionary partition for the store column depends on which alias the
/// header matched: ship-to style headers resolve under ship_to, customer
/// style under customer, the rest under store.
fn store_kind(raw_header: &str) -> EntityKind {
    let header = crate::headers::normalize_header(raw_header);
    if ["送り先", "発送先", "届け先", "納品先"]
        .iter()
        .any(|kw| header.contains(kw))
    {
        EntityKind::ShipTo
    } else if header.contains("客") {
        EntityKind::Customer
    } else {
        EntityKind::Store
    }
}

fn cell<'a>(row: &'a [String], idx: Option<usize>) -> &'a str {
    idx.and_then(|i| row.get(i)).map(String::as_str).unwrap_or("")
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

pub struct ExtractContext<'a> {
    pub resolver: &'a mut EntityResolver,
    pub classifier: &'a mut Classifier,
    pub oracle: &'a dyn NameOracle,
    pub log: &'a UnmatchedLog,
}

/// Turn one header-mapped table into canonical records. Rows without a
/// parseable amount or an interpretable date are dropped and logged; every
/// other defect degrades to a logged warning on an emitted row.
pub fn extract_table(
    table: &RawTable,
    map: &HeaderMap,
    meta: &FileMeta,
    source_file: &str,
    ctx: &mut ExtractContext,
) -> Vec<CanonicalRecord> {
    let date_col = map.column(CanonicalField::Date);
    if date_col.is_none() {
        ctx.log.append("列不足", source_file, "日付列が存在しません");
    }

    let mut records = Vec::new();
    for (row_no, row) in table.rows.iter().enumerate() {
        let amount_raw = cell(row, map.column(CanonicalField::Amount));
        let Some(amount) = parse_number(amount_raw) else {
            ctx.log.append(
                "金額解釈失敗",
                amount_raw,
                &format!("{source_file}#行{}", row_no + 2),
            );
            continue;
        };

        let date_raw = cell(row, date_col);
        let date = dates::interpret(date_raw, meta.year);
        if date.is_empty() {
            ctx.log.append(
                "日付解釈失敗",
                date_raw,
                &format!("{source_file}#行{}", row_no + 2),
            );
            continue;
        }

        let quantity = parse_number(cell(row, map.column(CanonicalField::Quantity)));
        let unit_price = parse_number(cell(row, map.column(CanonicalField::UnitPrice)));
        if let (Some(q), Some(p)) = (quantity, unit_price) {
            if consistency_mismatch(q, p, amount) {
                ctx.log.append(
                    "数量単価不一致",
                    &format!("{q} × {p} ≠ {amount}"),
                    &format!("{source_file}#行{}", row_no + 2),
                );
            }
        }

        let entity = resolve_entity(row, map, ctx);

        let item = crate::resolver::clean(cell(row, map.column(CanonicalField::ItemOrService)));
        let classification = ctx.classifier.classify(&item, ctx.oracle);
        if classification == Classification::Unknown && !item.is_empty() {
            ctx.log
                .queue_review(source_file, &row_context(table, row), "分類不能");
        }

        let quantity = match classification {
            Classification::Service if quantity.unwrap_or(0.0) == 0.0 => Some(1.0),
            _ => quantity,
        };

        records.push(CanonicalRecord {
            department: meta.department.clone(),
            company: meta.company.clone(),
            date,
            entity,
            item,
            classification,
            quantity,
            unit_price,
            amount,
            voucher_no: extra_identifier(row, map, "伝票番号"),
            order_no: extra_identifier(row, map, "注文番号"),
            source_file: source_file.to_string(),
        });
    }
    records
}

/// Highest-priority present entity column wins: store, then client, then
/// company, each under its own dictionary partition.
fn resolve_entity(row: &[String], map: &HeaderMap, ctx: &mut ExtractContext) -> String {
    let store_raw = cell(row, map.column(CanonicalField::Store));
    if !store_raw.trim().is_empty() {
        let kind = map
            .raw_header(CanonicalField::Store)
            .map(store_kind)
            .unwrap_or(EntityKind::Store);
        let name = match kind {
            EntityKind::ShipTo | EntityKind::Customer => strip_honorific(store_raw),
            _ => store_raw.to_string(),
        };
        return ctx.resolver.resolve(&name, kind, ctx.oracle, ctx.log);
    }

    let client_raw = cell(row, map.column(CanonicalField::Client));
    if !client_raw.trim().is_empty() {
        return ctx
            .resolver
            .resolve(client_raw, EntityKind::Client, ctx.oracle, ctx.log);
    }

    let company_raw = cell(row, map.column(CanonicalField::Company));
    if !company_raw.trim().is_empty() {
        return ctx
            .resolver
            .resolve(company_raw, EntityKind::Company, ctx.oracle, ctx.log);
    }

    String::new()
}

fn extra_identifier(row: &[String], map: &HeaderMap, header_key: &str) -> String {
    for (idx, header) in map.extras() {
        if header.contains(header_key) {
            return normalize_identifier(cell(row, Some(*idx)));
        }
    }
    String::new()
}

fn row_context(table: &RawTable, row: &[String]) -> String {
    table
        .headers
        .iter()
        .zip(row.iter())
        .filter(|(_, v)| !v.trim().is_empty())
        .map(|(h, v)| format!("{h}={v}"))
        .collect::<Vec<_>>()
        .join(" | ")
}
