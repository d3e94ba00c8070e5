use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Workbook error: {0}")]
    Workbook(#[from] calamine::Error),

    #[error("Spreadsheet write error: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),

    #[error("Filename does not match 部署_企業_YYYY年M月 pattern: {0}")]
    InvalidFilename(String),

    #[error("No amount column found in {0}")]
    MissingAmountColumn(String),

    #[error("Settings error: {0}")]
    Settings(String),

    #[error("{0}")]
    Other(String),
}

impl LedgerError {
    /// Structural errors abort the whole file and send it to the error
    /// archive; everything else degrades row by row.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidFilename(_) | LedgerError::MissingAmountColumn(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
