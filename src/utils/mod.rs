use anyhow::{anyhow, Result};
use chrono::{Datelike, NaiveDate, Utc};
use sha2::{Digest, Sha256};

const MONTH_NAMES: [&str; 12] = [
    "Janeiro",
    "Fevereiro",
    "Março",
    "Abril",
    "Maio",
    "Junho",
    "Julho",
    "Agosto",
    "Setembro",
    "Outubro",
    "Novembro",
    "Dezembro",
];

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn format_decimal(value: f64) -> String {
    format!("{:.2}", value)
}

/// Parses "42.50", "42,50" and "1.234,56" style amounts.
pub fn parse_decimal(value: &str) -> Result<f64> {
    let raw = value.trim().trim_start_matches('€').trim_end_matches('€').trim();
    let cleaned = if raw.contains(',') && raw.contains('.') {
        raw.replace('.', "").replace(',', ".")
    } else {
        raw.replace(',', ".")
    };
    cleaned
        .parse::<f64>()
        .map_err(|e| anyhow!("Parse decimal: {}", e))
}

pub fn amounts_match(a: f64, b: f64) -> bool {
    (a - b).abs() < 0.01
}

pub fn normalize_date(value: Option<String>) -> Option<String> {
    let raw = value?.trim().to_string();
    if raw.is_empty() {
        return None;
    }

    let formats = ["%Y-%m-%d", "%d-%m-%Y", "%d.%m.%Y", "%d/%m/%Y", "%Y/%m/%d", "%Y.%m.%d"];
    for fmt in formats.iter() {
        if let Ok(date) = NaiveDate::parse_from_str(&raw, fmt) {
            return Some(date.format("%Y-%m-%d").to_string());
        }
    }
    None
}

pub fn parse_iso_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.get(..10)?, "%Y-%m-%d").ok()
}

pub fn year_of(date: &str) -> Option<i32> {
    parse_iso_date(date).map(|d| d.year())
}

pub fn month_of(date: &str) -> Option<u32> {
    parse_iso_date(date).map(|d| d.month())
}

/// Month tab title, e.g. "03 - Março"; the numeric prefix keeps tabs ordered.
pub fn month_tab_name(month: u32) -> Option<String> {
    let name = MONTH_NAMES.get(month.checked_sub(1)? as usize)?;
    Some(format!("{:02} - {}", month, name))
}

pub fn tab_for_date(date: &str) -> Option<String> {
    month_of(date).and_then(month_tab_name)
}

pub fn workbook_name(year: i32) -> String {
    format!("Faturas {}", year)
}

pub fn normalize_supplier(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase()
}

pub fn normalize_summary(value: Option<&str>) -> String {
    value.unwrap_or_default().trim().to_lowercase()
}

/// File name used in storage: date, supplier and amount, filesystem-safe.
pub fn stored_file_name(date: &str, supplier: &str, amount: f64, original: &str) -> String {
    let extension = original
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.is_empty() && ext.len() <= 5)
        .unwrap_or_else(|| "pdf".to_string());
    let supplier: String = supplier
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!(
        "{}_{}_{}.{}",
        date,
        supplier.trim_matches('_'),
        format_decimal(amount),
        extension
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_european_amounts() {
        assert_eq!(parse_decimal("42,50").unwrap(), 42.5);
        assert_eq!(parse_decimal("1.234,56").unwrap(), 1234.56);
        assert_eq!(parse_decimal(" 7.10 ").unwrap(), 7.1);
        assert!(parse_decimal("abc").is_err());
    }

    #[test]
    fn month_tabs_are_zero_padded() {
        assert_eq!(month_tab_name(1).as_deref(), Some("01 - Janeiro"));
        assert_eq!(month_tab_name(12).as_deref(), Some("12 - Dezembro"));
        assert_eq!(month_tab_name(0), None);
        assert_eq!(month_tab_name(13), None);
        assert_eq!(tab_for_date("2025-03-09").as_deref(), Some("03 - Março"));
    }

    #[test]
    fn normalizes_dates_to_iso() {
        assert_eq!(
            normalize_date(Some("10/01/2025".to_string())).as_deref(),
            Some("2025-01-10")
        );
        assert_eq!(normalize_date(Some("garbage".to_string())), None);
        assert_eq!(normalize_date(Some("  ".to_string())), None);
    }

    #[test]
    fn stored_file_name_is_safe() {
        assert_eq!(
            stored_file_name("2025-01-10", "GALP ENERGIA, SA", 42.5, "scan.PDF"),
            "2025-01-10_GALP_ENERGIA__SA_42.50.pdf"
        );
    }
}
