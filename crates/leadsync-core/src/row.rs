//! # Table Rows
//!
//! The sheet's column schema and the pure lead → row transformation.
//!
//! ## Column Roles
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ID │ Ф.И.О. │ Контактный номер │ Бюджет сделки │ Заказ № │ ... │ статус │
//! │  ▲      ▲            ▲                  ▲            ▲            ▲      │
//! │  │      │            │                  │            │            │      │
//! │  id   contact      phone             price        marker       status   │
//! │                                                                         │
//! │  Any other column is filled from the lead custom field with the same    │
//! │  (whitespace-normalized) name. Date columns get dd.mm.YYYY.            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;

use chrono::{FixedOffset, TimeZone};
use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, ValidationError};
use crate::types::{EntityId, Lead};

// =============================================================================
// Schema
// =============================================================================

/// Ordered column schema plus the role of each special column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSchema {
    /// Header row, in order.
    pub columns: Vec<String>,

    pub id_column: String,
    pub status_column: String,

    /// Operator-filled column whose first fill means "dispatched".
    pub marker_column: String,

    pub contact_column: String,
    pub phone_column: String,
    pub budget_column: String,
    pub company_column: String,
    pub pipeline_column: String,
    pub responsible_column: String,

    /// Custom field holding a staff code, translated into `responsible_column`.
    pub staff_code_column: String,

    /// Columns whose custom-field values are Unix timestamps.
    pub date_columns: Vec<String>,
}

impl Default for TableSchema {
    fn default() -> Self {
        let columns = [
            "ID",
            "Ф.И.О.",
            "Контактный номер",
            "Бюджет сделки",
            "Заказ №",
            "Продукт 1",
            "Количество 1",
            "Продукт 2",
            "Количество 2",
            "Группа",
            "Дата заказа",
            "Дата доставка",
            "Регион",
            "Адрес",
            "Тип продажи",
            "Продажа в рассрочку",
            "Код сотрудника",
            "Компания",
            "Воронка",
            "статус",
            "Ответственный",
        ];
        TableSchema {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            id_column: "ID".into(),
            status_column: "статус".into(),
            marker_column: "Заказ №".into(),
            contact_column: "Ф.И.О.".into(),
            phone_column: "Контактный номер".into(),
            budget_column: "Бюджет сделки".into(),
            company_column: "Компания".into(),
            pipeline_column: "Воронка".into(),
            responsible_column: "Ответственный".into(),
            staff_code_column: "Код сотрудника".into(),
            date_columns: vec!["Дата заказа".into(), "Дата доставка".into()],
        }
    }
}

impl TableSchema {
    /// Zero-based position of a column.
    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }

    pub fn id_index(&self) -> usize {
        self.index_of(&self.id_column).unwrap_or(0)
    }

    pub fn status_index(&self) -> usize {
        self.index_of(&self.status_column).unwrap_or(0)
    }

    pub fn marker_index(&self) -> usize {
        self.index_of(&self.marker_column).unwrap_or(0)
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Every role column must appear in `columns`.
    pub fn validate(&self) -> CoreResult<()> {
        if self.columns.is_empty() {
            return Err(ValidationError::Required {
                field: "table.schema.columns".into(),
            }
            .into());
        }
        let roles = [
            &self.id_column,
            &self.status_column,
            &self.marker_column,
            &self.contact_column,
            &self.phone_column,
            &self.budget_column,
            &self.company_column,
            &self.pipeline_column,
            &self.responsible_column,
        ];
        for role in roles {
            if self.index_of(role).is_none() {
                return Err(ValidationError::InvalidFormat {
                    field: "table.schema".into(),
                    reason: format!("column '{}' is not in the header", role),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Reads the tracked fields of a raw grid row. Rows without a numeric id
    /// yield `None`.
    pub fn view(&self, cells: &[String]) -> Option<RowView> {
        let cell = |idx: usize| cells.get(idx).map(|c| c.trim()).unwrap_or("");
        let id = cell(self.id_index()).parse::<EntityId>().ok()?;
        if id.is_unset() {
            return None;
        }
        Some(RowView {
            id,
            status: cell(self.status_index()).to_string(),
            marker: cell(self.marker_index()).to_string(),
        })
    }
}

/// The fields of a sheet row the reconciliation loop cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowView {
    pub id: EntityId,
    pub status: String,
    pub marker: String,
}

/// A full row ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRow {
    pub id: EntityId,
    pub cells: Vec<String>,
}

/// Whether a raw grid row is blank (operator cleared it).
pub fn is_blank(cells: &[String]) -> bool {
    cells.iter().all(|c| c.trim().is_empty())
}

/// Strips leading zeros from numeric staff codes ("0100" → "100").
pub fn normalize_staff_code(code: &str) -> String {
    let trimmed = code.trim();
    match trimmed.parse::<u64>() {
        Ok(n) => n.to_string(),
        Err(_) => trimmed.to_string(),
    }
}

// =============================================================================
// Row Builder
// =============================================================================

/// Everything `build_row` needs besides the lead itself.
pub struct RowContext<'a> {
    pub schema: &'a TableSchema,
    pub status: &'a str,
    pub pipeline: &'a str,
    pub responsible: &'a str,
    /// Normalized staff code → display name.
    pub staff: &'a HashMap<String, String>,
    /// Offset used to render date columns.
    pub offset: FixedOffset,
}

fn render_date(epoch: i64, offset: FixedOffset) -> Option<String> {
    if epoch == 0 {
        return Some(String::new());
    }
    offset
        .timestamp_opt(epoch, 0)
        .single()
        .map(|dt| dt.format("%d.%m.%Y").to_string())
}

/// Builds the full sheet row for a freshly fetched lead.
pub fn build_row(lead: &Lead, ctx: &RowContext<'_>) -> TableRow {
    let schema = ctx.schema;
    let mut mapped: HashMap<&str, String> = HashMap::new();

    mapped.insert(schema.id_column.as_str(), lead.id.to_string());
    mapped.insert(
        schema.budget_column.as_str(),
        lead.price.map(|p| p.to_string()).unwrap_or_default(),
    );
    mapped.insert(schema.status_column.as_str(), ctx.status.to_string());
    mapped.insert(schema.pipeline_column.as_str(), ctx.pipeline.to_string());
    mapped.insert(schema.contact_column.as_str(), lead.contact_name());
    mapped.insert(schema.phone_column.as_str(), lead.contact_phone());
    mapped.insert(schema.company_column.as_str(), lead.company_name());
    mapped.insert(schema.responsible_column.as_str(), ctx.responsible.to_string());

    for field in lead.custom_fields() {
        let name = field.normalized_name();
        let Some(column) = schema.columns.iter().find(|c| **c == name) else {
            continue;
        };
        let values = field.values();
        if values.is_empty() {
            continue;
        }

        let mut text = values
            .iter()
            .filter_map(|v| v.as_text())
            .collect::<Vec<_>>()
            .join(", ");

        if schema.date_columns.iter().any(|d| d == column) {
            if let Some(date) = values[0].as_epoch().and_then(|e| render_date(e, ctx.offset)) {
                text = date;
            }
        }

        if *column == schema.staff_code_column {
            if let Some(name) = ctx.staff.get(&normalize_staff_code(&text)) {
                mapped.insert(schema.responsible_column.as_str(), name.clone());
            }
        }

        mapped.insert(column.as_str(), text);
    }

    TableRow {
        id: lead.id,
        cells: schema
            .columns
            .iter()
            .map(|c| mapped.get(c.as_str()).cloned().unwrap_or_default())
            .collect(),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn lead() -> Lead {
        serde_json::from_value(serde_json::json!({
            "id": 555,
            "name": "Сделка",
            "price": 450000,
            "pipeline_id": 10,
            "status_id": 101,
            "custom_fields_values": [
                { "field_name": "Продукт  1", "values": [{ "value": "Bioflex" }, { "value": "Gel" }] },
                { "field_name": "Дата заказа", "values": [{ "value": 1_704_067_200 }] },
                { "field_name": "Дата доставка", "values": [{ "value": 0 }] },
                { "field_name": "Код сотрудника", "values": [{ "value": "0100" }] },
                { "field_name": "Не в таблице", "values": [{ "value": "x" }] }
            ],
            "_embedded": {
                "contacts": [{ "id": 1, "name": "Азиз", "custom_fields_values": [
                    { "field_code": "PHONE", "field_name": "Телефон", "values": [{ "value": "+998901112233" }] }
                ]}],
                "companies": []
            }
        }))
        .unwrap()
    }

    fn cell<'a>(schema: &TableSchema, row: &'a TableRow, column: &str) -> &'a str {
        &row.cells[schema.index_of(column).unwrap()]
    }

    #[test]
    fn test_build_row_maps_all_roles() {
        let schema = TableSchema::default();
        let mut staff = HashMap::new();
        staff.insert("100".to_string(), "Нилуфар А.".to_string());
        let ctx = RowContext {
            schema: &schema,
            status: "В процессе",
            pipeline: "Нилуфар",
            responsible: "admin",
            staff: &staff,
            offset: FixedOffset::east_opt(5 * 3600).unwrap(),
        };

        let row = build_row(&lead(), &ctx);
        assert_eq!(row.cells.len(), schema.width());
        assert_eq!(cell(&schema, &row, "ID"), "555");
        assert_eq!(cell(&schema, &row, "Ф.И.О."), "Азиз");
        assert_eq!(cell(&schema, &row, "Контактный номер"), "+998901112233");
        assert_eq!(cell(&schema, &row, "Бюджет сделки"), "450000");
        assert_eq!(cell(&schema, &row, "Продукт 1"), "Bioflex, Gel");
        assert_eq!(cell(&schema, &row, "Дата заказа"), "01.01.2024");
        assert_eq!(cell(&schema, &row, "Дата доставка"), "");
        assert_eq!(cell(&schema, &row, "Код сотрудника"), "0100");
        assert_eq!(cell(&schema, &row, "Ответственный"), "Нилуфар А.");
        assert_eq!(cell(&schema, &row, "статус"), "В процессе");
        assert_eq!(cell(&schema, &row, "Воронка"), "Нилуфар");
        assert_eq!(cell(&schema, &row, "Заказ №"), "");
    }

    #[test]
    fn test_unknown_staff_code_keeps_responsible_user() {
        let schema = TableSchema::default();
        let staff = HashMap::new();
        let ctx = RowContext {
            schema: &schema,
            status: "В процессе",
            pipeline: "",
            responsible: "admin",
            staff: &staff,
            offset: FixedOffset::east_opt(0).unwrap(),
        };
        let row = build_row(&lead(), &ctx);
        assert_eq!(cell(&schema, &row, "Ответственный"), "admin");
    }

    #[test]
    fn test_view_reads_tracked_fields() {
        let schema = TableSchema::default();
        let mut cells = vec![String::new(); schema.width()];
        cells[schema.id_index()] = " 555 ".into();
        cells[schema.status_index()] = "Отказ".into();
        cells[schema.marker_index()] = "A-17".into();
        let view = schema.view(&cells).unwrap();
        assert_eq!(view.id, EntityId::new(555));
        assert_eq!(view.status, "Отказ");
        assert_eq!(view.marker, "A-17");

        cells[schema.id_index()] = "header".into();
        assert!(schema.view(&cells).is_none());
        assert!(schema.view(&[]).is_none());
    }

    #[test]
    fn test_schema_validation() {
        let mut schema = TableSchema::default();
        assert!(schema.validate().is_ok());
        schema.status_column = "Status".into();
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_normalize_staff_code() {
        assert_eq!(normalize_staff_code("0005"), "5");
        assert_eq!(normalize_staff_code(" 100 "), "100");
        assert_eq!(normalize_staff_code("A12"), "A12");
    }
}
