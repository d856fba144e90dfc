//! Rediscovers the ledger row of a record. Rows carry no durable key, so every lookup is a
//! heuristic match over the tab's current contents.

use crate::error::ServiceResult;
use crate::models::{LedgerColumn, RowSnapshot};
use crate::services::sheets::{LedgerService, FIRST_DATA_ROW};
use crate::utils::{amounts_match, parse_decimal};

/// A matched row with the values it held when read.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedRow {
    /// 1-indexed sheet row.
    pub row: usize,
    pub values: Vec<String>,
}

fn cell(row: &[String], column: LedgerColumn) -> &str {
    row.get(column.index()).map(|s| s.trim()).unwrap_or_default()
}

/// Index of the matching data row, as a 1-indexed sheet row.
///
/// Priority: document number, then supplier and amount, then supplier and date.
pub fn locate_in_rows(rows: &[Vec<String>], snapshot: &RowSnapshot) -> Option<usize> {
    let doc_number = snapshot
        .doc_number
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());

    if let Some(number) = doc_number {
        if let Some(index) = rows
            .iter()
            .position(|row| cell(row, LedgerColumn::DocNumber).eq_ignore_ascii_case(number))
        {
            return Some(index + FIRST_DATA_ROW);
        }
    }

    let supplier = snapshot.supplier_name.trim().to_lowercase();
    let same_supplier =
        |row: &Vec<String>| cell(row, LedgerColumn::Supplier).to_lowercase() == supplier;

    let by_amount = rows.iter().position(|row| {
        same_supplier(row)
            && parse_decimal(cell(row, LedgerColumn::Amount))
                .map(|amount| amounts_match(amount, snapshot.total_amount))
                .unwrap_or(false)
    });
    if let Some(index) = by_amount {
        return Some(index + FIRST_DATA_ROW);
    }

    rows.iter()
        .position(|row| {
            same_supplier(row)
                    && cell(row, LedgerColumn::Date) == snapshot.doc_date
        })
        .map(|index| index + FIRST_DATA_ROW)
}

/// Reads the tab once and matches against it. `None` is an expected outcome.
pub async fn locate_row(
    ledger: &dyn LedgerService,
    workbook_id: &str,
    tab: &str,
    snapshot: &RowSnapshot,
) -> ServiceResult<Option<LocatedRow>> {
    let rows = ledger.read_rows(workbook_id, tab).await?;
    let located = locate_in_rows(&rows, snapshot).map(|row| LocatedRow {
        row,
        values: rows[row - FIRST_DATA_ROW].clone(),
    });
    match &located {
        Some(found) => tracing::debug!(workbook_id, tab, row = found.row, "Ledger row located"),
        None => tracing::debug!(workbook_id, tab, rows = rows.len(), "Ledger row not found"),
    }
    Ok(located)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(date: &str, supplier: &str, number: &str, amount: &str) -> Vec<String> {
        let mut values = vec![String::new(); LedgerColumn::ALL.len()];
        values[LedgerColumn::Date.index()] = date.to_string();
        values[LedgerColumn::Supplier.index()] = supplier.to_string();
        values[LedgerColumn::DocNumber.index()] = number.to_string();
        values[LedgerColumn::Amount.index()] = amount.to_string();
        values
    }

    fn snapshot(doc_number: Option<&str>, supplier: &str, amount: f64, date: &str) -> RowSnapshot {
        RowSnapshot {
            doc_number: doc_number.map(str::to_string),
            supplier_name: supplier.to_string(),
            total_amount: amount,
            doc_date: date.to_string(),
        }
    }

    #[test]
    fn doc_number_wins_over_earlier_amount_match() {
        let rows = vec![
            row("2025-01-03", "GALP", "", "42.50"),
            row("2025-01-10", "GALP", "ft 2025/7", "99.00"),
        ];
        let found = locate_in_rows(&rows, &snapshot(Some("FT 2025/7"), "GALP", 42.5, "2025-01-03"));
        assert_eq!(found, Some(3));
    }

    #[test]
    fn supplier_and_amount_within_a_cent() {
        let rows = vec![
            row("2025-01-03", "EDP", "", "10.00"),
            row("2025-01-04", "galp", "", "42,505"),
        ];
        assert_eq!(locate_in_rows(&rows, &snapshot(None, "GALP", 42.5, "2025-02-01")), Some(3));
        assert_eq!(locate_in_rows(&rows, &snapshot(None, "GALP", 42.6, "2025-02-01")), None);
    }

    #[test]
    fn supplier_and_date_as_last_resort() {
        let rows = vec![row("2025-01-03", "GALP", "", "12.00")];
        assert_eq!(locate_in_rows(&rows, &snapshot(None, "Galp", 99.0, "2025-01-03")), Some(2));
    }

    #[test]
    fn stale_doc_number_falls_back_to_supplier_and_amount() {
        let rows = vec![row("2025-01-03", "GALP", "FT 1", "42.50")];
        let found = locate_in_rows(&rows, &snapshot(Some("FT 2"), "GALP", 42.5, "2025-01-09"));
        assert_eq!(found, Some(2));
        let found = locate_in_rows(&rows, &snapshot(Some("FT 2"), "GALP", 13.0, "2025-01-03"));
        assert_eq!(found, Some(2));
    }

    #[test]
    fn short_rows_do_not_panic() {
        let rows = vec![vec!["2025-01-03".to_string()], vec![]];
        assert_eq!(locate_in_rows(&rows, &snapshot(None, "GALP", 1.0, "2025-01-03")), None);
    }
}
