use std::path::Path;

use regex::Regex;

// ---------------------------------------------------------------------------
// File metadata
// ---------------------------------------------------------------------------

/// Department, requesting company and period parsed from a ledger filename
/// of the form `営業部_株式会社Forneeds_2025年1月.xlsx`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {
    pub department: String,
    pub company: String,
    pub year: i32,
    pub month: u32,
}

impl FileMeta {
    pub fn period(&self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }
}

pub fn parse_filename(path: &Path) -> Option<FileMeta> {
    let stem = path.file_stem()?.to_str()?;
    let re = Regex::new(r"^(.+?)_(.+?)_(\d{4})年(\d{1,2})月").ok()?;
    let caps = re.captures(stem)?;
    let year: i32 = caps[3].parse().ok()?;
    let month: u32 = caps[4].parse().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    Some(FileMeta {
        department: caps[1].to_string(),
        company: caps[2].to_string(),
        year,
        month,
    })
}

// ---------------------------------------------------------------------------
// Canonical fields and entity kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalField {
    Department,
    Client,
    Date,
    Company,
    Store,
    ItemOrService,
    Quantity,
    UnitPrice,
    Amount,
}

/// Dictionary partition a raw name is resolved under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Company,
    Store,
    Client,
    Customer,
    ShipTo,
}

impl EntityKind {
    /// Stable key used in the dictionary store.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Company => "company",
            Self::Store => "store",
            Self::Client => "client",
            Self::Customer => "customer",
            Self::ShipTo => "ship_to",
        }
    }

    /// Japanese field label used in oracle prompts and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Company => "企業名",
            Self::Store => "店舗名",
            Self::Client => "ご依頼主",
            Self::Customer => "お客様名",
            Self::ShipTo => "発送先名",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "company" => Some(Self::Company),
            "store" => Some(Self::Store),
            "client" => Some(Self::Client),
            "customer" => Some(Self::Customer),
            "ship_to" => Some(Self::ShipTo),
            _ => None,
        }
    }
}

pub const ALL_ENTITY_KINDS: &[EntityKind] = &[
    EntityKind::Company,
    EntityKind::Store,
    EntityKind::Client,
    EntityKind::Customer,
    EntityKind::ShipTo,
];

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Product,
    Service,
    Unknown,
}

impl Classification {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Product => "商品",
            Self::Service => "作業",
            Self::Unknown => "",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "商品" => Some(Self::Product),
            "作業" => Some(Self::Service),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tabular data
// ---------------------------------------------------------------------------

/// One sheet's worth of cells, headers split off, everything stringly typed.
#[derive(Debug, Clone)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

/// The validated line item every downstream stage consumes. Immutable once
/// built; the next aggregation run supersedes rather than mutates.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRecord {
    pub department: String,
    pub company: String,
    pub date: String,
    pub entity: String,
    pub item: String,
    pub classification: Classification,
    pub quantity: Option<f64>,
    pub unit_price: Option<f64>,
    pub amount: f64,
    pub voucher_no: String,
    pub order_no: String,
    pub source_file: String,
}
