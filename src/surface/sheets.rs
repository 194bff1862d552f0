use super::{CalculationSurface, CellRef, CellValue, SurfaceError, WriteMode};
use crate::http::build_client;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::env;

static SHEETS_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("SHEETS_API_ROOT")
        .unwrap_or_else(|_| "https://sheets.googleapis.com/v4/spreadsheets".to_string())
});

/// Google Sheets values API as a calculation surface. Reads are unformatted
/// so numbers come back as numbers and text as text.
#[derive(Clone)]
pub struct SheetsSurface {
    client: Client,
    spreadsheet_id: String,
    access_token: String,
}

#[derive(Deserialize)]
struct BatchGetResponse {
    #[serde(default, rename = "valueRanges")]
    value_ranges: Vec<ValueRange>,
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

impl SheetsSurface {
    pub fn new(spreadsheet_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            client: build_client(),
            spreadsheet_id: spreadsheet_id.into(),
            access_token: access_token.into(),
        }
    }

    /// Requires `SHEETS_SPREADSHEET_ID` and `SHEETS_ACCESS_TOKEN`.
    pub fn from_env() -> Option<Self> {
        let id = env::var("SHEETS_SPREADSHEET_ID").ok().filter(|v| !v.trim().is_empty())?;
        let token = env::var("SHEETS_ACCESS_TOKEN").ok().filter(|v| !v.trim().is_empty())?;
        Some(Self::new(id.trim(), token.trim()))
    }

    fn endpoint(&self, suffix: &str) -> String {
        format!(
            "{}/{}/values:{suffix}",
            SHEETS_ROOT.as_str(),
            urlencoding::encode(&self.spreadsheet_id)
        )
    }
}

fn a1(sheet: &str, cell: &CellRef) -> String {
    format!("'{}'!{cell}", sheet.replace('\'', "''"))
}

/// Under USER_ENTERED a numeric-looking string would be coerced to a number,
/// so text is sent with the literal-text prefix.
fn to_json(value: &CellValue, mode: WriteMode) -> Value {
    match value {
        CellValue::Empty => json!(""),
        CellValue::Number(n) => match mode {
            WriteMode::UserEntered => json!(n),
            WriteMode::Raw => json!(n.to_string()),
        },
        CellValue::Text(text) => {
            if mode == WriteMode::UserEntered && text.trim().parse::<f64>().is_ok() {
                json!(format!("'{text}"))
            } else {
                json!(text)
            }
        }
    }
}

fn from_json(value: Option<&Value>) -> CellValue {
    match value {
        None | Some(Value::Null) => CellValue::Empty,
        Some(Value::Number(n)) => n.as_f64().map(CellValue::Number).unwrap_or(CellValue::Empty),
        Some(Value::String(s)) if s.is_empty() => CellValue::Empty,
        Some(Value::String(s)) => CellValue::Text(s.clone()),
        Some(Value::Bool(b)) => CellValue::Text(b.to_string().to_uppercase()),
        Some(other) => CellValue::Text(other.to_string()),
    }
}

#[async_trait]
impl CalculationSurface for SheetsSurface {
    fn name(&self) -> &'static str {
        "sheets"
    }

    async fn write_cells(
        &self,
        sheet: &str,
        cells: &[(CellRef, CellValue)],
        mode: WriteMode,
    ) -> Result<(), SurfaceError> {
        let data: Vec<Value> = cells
            .iter()
            .map(|(cell, value)| {
                json!({
                    "range": a1(sheet, cell),
                    "values": [[to_json(value, mode)]],
                })
            })
            .collect();
        let body = json!({
            "valueInputOption": mode.as_str(),
            "data": data,
        });
        let response = self
            .client
            .post(self.endpoint("batchUpdate"))
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|err| SurfaceError::Transport(err.to_string()))?;
        let status = response.status();
        if status == reqwest::StatusCode::FORBIDDEN {
            let detail = response.text().await.unwrap_or_default();
            return Err(SurfaceError::Protected(detail));
        }
        if !status.is_success() {
            return Err(SurfaceError::Transport(format!("HTTP {status}")));
        }
        Ok(())
    }

    async fn read_cells(
        &self,
        sheet: &str,
        cells: &[CellRef],
    ) -> Result<Vec<CellValue>, SurfaceError> {
        let mut query: Vec<(&str, String)> = cells
            .iter()
            .map(|cell| ("ranges", a1(sheet, cell)))
            .collect();
        query.push(("valueRenderOption", "UNFORMATTED_VALUE".into()));
        let response = self
            .client
            .get(self.endpoint("batchGet"))
            .bearer_auth(&self.access_token)
            .query(&query)
            .send()
            .await
            .map_err(|err| SurfaceError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SurfaceError::Transport(format!(
                "HTTP {}",
                response.status()
            )));
        }
        let payload: BatchGetResponse = response
            .json()
            .await
            .map_err(|err| SurfaceError::Malformed(err.to_string()))?;
        if payload.value_ranges.len() != cells.len() {
            return Err(SurfaceError::Malformed(format!(
                "asked for {} ranges, got {}",
                cells.len(),
                payload.value_ranges.len()
            )));
        }
        Ok(payload
            .value_ranges
            .iter()
            .map(|range| from_json(range.values.first().and_then(|row| row.first())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_quote_the_sheet_name() {
        assert_eq!(a1("search_base", &CellRef::new("B", 10)), "'search_base'!B10");
        assert_eq!(a1("bob's", &CellRef::new("K", 9)), "'bob''s'!K9");
    }

    #[test]
    fn numeric_text_keeps_its_type_under_user_entered() {
        assert_eq!(
            to_json(&CellValue::Text("261068".into()), WriteMode::UserEntered),
            json!("'261068")
        );
        assert_eq!(
            to_json(&CellValue::Text("https://x".into()), WriteMode::UserEntered),
            json!("https://x")
        );
        assert_eq!(
            to_json(&CellValue::Number(5000.0), WriteMode::UserEntered),
            json!(5000.0)
        );
        assert_eq!(to_json(&CellValue::Empty, WriteMode::UserEntered), json!(""));
    }

    #[test]
    fn missing_ranges_read_as_empty() {
        let payload: BatchGetResponse = serde_json::from_value(json!({
            "valueRanges": [
                {"range": "'s'!N10"},
                {"range": "'s'!P10", "values": [[755]]},
                {"range": "'s'!O10", "values": [["EMS"]]},
            ]
        }))
        .expect("payload");
        let values: Vec<_> = payload
            .value_ranges
            .iter()
            .map(|range| from_json(range.values.first().and_then(|row| row.first())))
            .collect();
        assert_eq!(
            values,
            vec![
                CellValue::Empty,
                CellValue::Number(755.0),
                CellValue::Text("EMS".into())
            ]
        );
    }
}
