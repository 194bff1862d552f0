use super::{CalculationSurface, CellRef, CellValue, SurfaceError, WriteMode};
use crate::models::{ProfitResult, ProfitSource};
use serde::Serialize;
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;
use tokio::time::{Duration, Instant, sleep};
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum BridgeError {
    #[error("refusing to write formula cell {0}")]
    FormulaCell(String),
    #[error("invalid surface layout: {0}")]
    Layout(String),
    #[error(transparent)]
    Surface(#[from] SurfaceError),
    #[error("unexpected cell contents: {0}")]
    Malformed(String),
}

/// Cell positions of one scratch row.
#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceLayout {
    pub sheet: String,
    pub row: u32,
    pub source_price: CellRef,
    pub sell_price: CellRef,
    pub listing_shipping: CellRef,
    pub weight_g: CellRef,
    pub depth_cm: CellRef,
    pub width_cm: CellRef,
    pub height_cm: CellRef,
    pub item_url: CellRef,
    pub category_id: CellRef,
    pub applied_weight: CellRef,
    pub total_cost: CellRef,
    pub carrier: CellRef,
    pub shipping_method: CellRef,
    pub profit: CellRef,
    pub margin: CellRef,
    pub profit_with_rebate: CellRef,
    pub margin_with_rebate: CellRef,
}

impl SurfaceLayout {
    pub fn at_row(sheet: impl Into<String>, row: u32) -> Result<Self, BridgeError> {
        if row < 2 {
            return Err(BridgeError::Layout(format!(
                "scratch row {row} leaves no room for the item url row"
            )));
        }
        let layout = Self {
            sheet: sheet.into(),
            row,
            source_price: CellRef::new("B", row),
            sell_price: CellRef::new("C", row),
            listing_shipping: CellRef::new("D", row),
            weight_g: CellRef::new("F", row),
            depth_cm: CellRef::new("G", row),
            width_cm: CellRef::new("H", row),
            height_cm: CellRef::new("I", row),
            item_url: CellRef::new("K", row - 1),
            category_id: CellRef::new("K", row + 1),
            applied_weight: CellRef::new("E", row),
            total_cost: CellRef::new("J", row),
            carrier: CellRef::new("N", row),
            shipping_method: CellRef::new("O", row),
            profit: CellRef::new("P", row),
            margin: CellRef::new("Q", row),
            profit_with_rebate: CellRef::new("P", row + 3),
            margin_with_rebate: CellRef::new("Q", row + 3),
        };
        layout.validate()?;
        Ok(layout)
    }

    pub fn input_cells(&self) -> Vec<CellRef> {
        vec![
            self.source_price.clone(),
            self.sell_price.clone(),
            self.listing_shipping.clone(),
            self.weight_g.clone(),
            self.depth_cm.clone(),
            self.width_cm.clone(),
            self.height_cm.clone(),
            self.item_url.clone(),
            self.category_id.clone(),
        ]
    }

    pub fn formula_cells(&self) -> Vec<CellRef> {
        vec![self.applied_weight.clone(), self.total_cost.clone()]
    }

    /// Order matters: `SurfaceOutputs::from_values` reads them positionally.
    pub fn output_cells(&self) -> Vec<CellRef> {
        vec![
            self.carrier.clone(),
            self.shipping_method.clone(),
            self.profit.clone(),
            self.margin.clone(),
            self.profit_with_rebate.clone(),
            self.margin_with_rebate.clone(),
        ]
    }

    pub fn all_cells(&self) -> HashSet<CellRef> {
        self.input_cells()
            .into_iter()
            .chain(self.formula_cells())
            .chain(self.output_cells())
            .collect()
    }

    pub fn is_formula(&self, cell: &CellRef) -> bool {
        self.formula_cells().contains(cell)
    }

    pub fn overlaps(&self, other: &SurfaceLayout) -> bool {
        self.sheet == other.sheet && !self.all_cells().is_disjoint(&other.all_cells())
    }

    fn validate(&self) -> Result<(), BridgeError> {
        let inputs: HashSet<_> = self.input_cells().into_iter().collect();
        let formulas: HashSet<_> = self.formula_cells().into_iter().collect();
        let outputs: HashSet<_> = self.output_cells().into_iter().collect();
        let total = self.input_cells().len() + self.formula_cells().len() + self.output_cells().len();
        if inputs.len() + formulas.len() + outputs.len() != total
            || !inputs.is_disjoint(&formulas)
            || !inputs.is_disjoint(&outputs)
            || !formulas.is_disjoint(&outputs)
        {
            return Err(BridgeError::Layout(format!(
                "input, formula and output cells of row {} overlap",
                self.row
            )));
        }
        Ok(())
    }
}

/// Values written to one scratch row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurfaceInputs {
    pub source_price: i64,
    pub sell_price: f64,
    pub listing_shipping: f64,
    pub weight_g: Option<u32>,
    pub dimensions_cm: Option<[f64; 3]>,
    pub item_url: Option<String>,
    pub category_id: Option<String>,
}

impl SurfaceInputs {
    pub fn new(source_price: f64, sell_price: f64, listing_shipping: f64) -> Self {
        Self {
            source_price: source_price.round() as i64,
            sell_price: round1(sell_price),
            listing_shipping: round1(listing_shipping),
            weight_g: None,
            dimensions_cm: None,
            item_url: None,
            category_id: None,
        }
    }

    /// Absent optionals become explicit empties so a previous request's
    /// values cannot survive in the row.
    pub fn to_cells(&self, layout: &SurfaceLayout) -> Vec<(CellRef, CellValue)> {
        let dims = self.dimensions_cm.map(|d| d.map(CellValue::Number));
        let [depth, width, height] = dims.unwrap_or([CellValue::Empty, CellValue::Empty, CellValue::Empty]);
        vec![
            (
                layout.source_price.clone(),
                CellValue::Number(self.source_price as f64),
            ),
            (layout.sell_price.clone(), CellValue::Number(self.sell_price)),
            (
                layout.listing_shipping.clone(),
                CellValue::Number(self.listing_shipping),
            ),
            (
                layout.weight_g.clone(),
                self.weight_g
                    .map(|w| CellValue::Number(f64::from(w)))
                    .unwrap_or(CellValue::Empty),
            ),
            (layout.depth_cm.clone(), depth),
            (layout.width_cm.clone(), width),
            (layout.height_cm.clone(), height),
            (layout.item_url.clone(), text_or_empty(&self.item_url)),
            (layout.category_id.clone(), text_or_empty(&self.category_id)),
        ]
    }

    /// Inverse of `to_cells`, in `input_cells` order. Fails when a cell no
    /// longer holds the type that was written.
    pub fn from_values(values: &[CellValue]) -> Result<Self, BridgeError> {
        let [source, sell, shipping, weight, depth, width, height, url, category] = values else {
            return Err(BridgeError::Malformed(format!(
                "expected 9 input cells, got {}",
                values.len()
            )));
        };
        let dimensions_cm = match (
            optional_number("depth", depth)?,
            optional_number("width", width)?,
            optional_number("height", height)?,
        ) {
            (Some(d), Some(w), Some(h)) => Some([d, w, h]),
            (None, None, None) => None,
            _ => {
                return Err(BridgeError::Malformed(
                    "package dimensions are partially filled".into(),
                ));
            }
        };
        Ok(Self {
            source_price: required_number("source_price", source)?.round() as i64,
            sell_price: required_number("sell_price", sell)?,
            listing_shipping: required_number("listing_shipping", shipping)?,
            weight_g: optional_number("weight_g", weight)?.map(|w| w.round() as u32),
            dimensions_cm,
            item_url: optional_text("item_url", url)?,
            category_id: optional_text("category_id", category)?,
        })
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn text_or_empty(value: &Option<String>) -> CellValue {
    value
        .as_ref()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| CellValue::Text(v.to_string()))
        .unwrap_or(CellValue::Empty)
}

fn required_number(name: &str, value: &CellValue) -> Result<f64, BridgeError> {
    optional_number(name, value)?
        .ok_or_else(|| BridgeError::Malformed(format!("{name} is empty")))
}

fn optional_number(name: &str, value: &CellValue) -> Result<Option<f64>, BridgeError> {
    match value {
        CellValue::Empty => Ok(None),
        CellValue::Number(n) => Ok(Some(*n)),
        CellValue::Text(text) => Err(BridgeError::Malformed(format!(
            "{name} holds text `{text}` instead of a number"
        ))),
    }
}

fn optional_text(name: &str, value: &CellValue) -> Result<Option<String>, BridgeError> {
    match value {
        CellValue::Empty => Ok(None),
        CellValue::Text(text) => Ok(Some(text.clone())),
        CellValue::Number(n) => Err(BridgeError::Malformed(format!(
            "{name} holds number {n} instead of text"
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Validity {
    Valid,
    Invalid { reason: String },
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        matches!(self, Validity::Valid)
    }
}

/// Raw output cells of one scratch row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SurfaceOutputs {
    pub carrier: CellValue,
    pub shipping_method: CellValue,
    pub profit: CellValue,
    pub margin: CellValue,
    pub profit_with_rebate: CellValue,
    pub margin_with_rebate: CellValue,
}

impl SurfaceOutputs {
    pub fn from_values(values: Vec<CellValue>) -> Result<Self, BridgeError> {
        let count = values.len();
        let Ok([carrier, shipping_method, profit, margin, profit_with_rebate, margin_with_rebate]) =
            <[CellValue; 6]>::try_from(values)
        else {
            return Err(BridgeError::Malformed(format!(
                "expected 6 output cells, got {count}"
            )));
        };
        Ok(Self {
            carrier,
            shipping_method,
            profit,
            margin,
            profit_with_rebate,
            margin_with_rebate,
        })
    }

    pub fn validity(&self) -> Validity {
        match self.numbers() {
            Ok(_) => Validity::Valid,
            Err(reason) => Validity::Invalid { reason },
        }
    }

    pub fn to_profit_result(&self) -> Option<ProfitResult> {
        let [profit, margin, profit_with_rebate, margin_with_rebate] = self.numbers().ok()?;
        Some(ProfitResult {
            profit_amount: profit.round() as i64,
            profit_margin_pct: margin.round() as i32,
            profit_amount_with_rebate: profit_with_rebate.round() as i64,
            profit_margin_pct_with_rebate: margin_with_rebate.round() as i32,
            carrier: self.carrier.text(),
            shipping_method: self.shipping_method.text(),
            source: ProfitSource::Surface,
        })
    }

    fn numbers(&self) -> Result<[f64; 4], String> {
        let profit = parse_numeric("profit", &self.profit)?;
        let margin = parse_numeric("margin", &self.margin)?;
        let profit_with_rebate = parse_numeric("profit_with_rebate", &self.profit_with_rebate)?;
        let margin_with_rebate = parse_numeric("margin_with_rebate", &self.margin_with_rebate)?;
        // 0/0 is what an unset row reports.
        if profit == 0.0 && margin == 0.0 {
            return Err("profit and margin are both zero".into());
        }
        if profit_with_rebate == 0.0 && margin_with_rebate == 0.0 {
            return Err("rebate profit and margin are both zero".into());
        }
        Ok([profit, margin, profit_with_rebate, margin_with_rebate])
    }
}

/// Accepts numbers and display strings such as `1,234円`, `12%` or the
/// apostrophe-prefixed text form `'1500`.
pub fn parse_numeric(name: &str, value: &CellValue) -> Result<f64, String> {
    match value {
        CellValue::Empty => Err(format!("{name} is empty")),
        CellValue::Number(n) if n.is_finite() => Ok(*n),
        CellValue::Number(n) => Err(format!("{name} is not finite ({n})")),
        CellValue::Text(text) => {
            let cleaned: String = text
                .trim()
                .trim_start_matches('\'')
                .chars()
                .filter(|c| !matches!(c, ',' | '¥' | '￥' | '円' | '%') && !c.is_whitespace())
                .collect();
            if cleaned.is_empty() {
                return Err(format!("{name} is empty"));
            }
            cleaned
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .ok_or_else(|| format!("{name} is non-numeric (`{text}`)"))
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeReading {
    pub outputs: SurfaceOutputs,
    pub validity: Validity,
    pub polls: u32,
}

/// Reads and writes one scratch row. Only input cells are ever written.
pub struct CalculationBridge {
    surface: Arc<dyn CalculationSurface>,
    layout: SurfaceLayout,
    poll_interval: Duration,
}

impl CalculationBridge {
    pub fn new(
        surface: Arc<dyn CalculationSurface>,
        layout: SurfaceLayout,
        poll_interval: Duration,
    ) -> Self {
        Self {
            surface,
            layout,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    pub fn layout(&self) -> &SurfaceLayout {
        &self.layout
    }

    pub async fn write_inputs(&self, inputs: &SurfaceInputs) -> Result<(), BridgeError> {
        let cells = inputs.to_cells(&self.layout);
        debug!(
            target = "research.surface",
            surface = self.surface.name(),
            row = self.layout.row,
            source_price = inputs.source_price,
            sell_price = inputs.sell_price,
            "writing inputs"
        );
        self.write_guarded(&cells).await
    }

    /// Every target is checked against the formula set before anything is
    /// sent, so a rejected batch leaves the surface untouched.
    pub async fn write_guarded(&self, cells: &[(CellRef, CellValue)]) -> Result<(), BridgeError> {
        if let Some((cell, _)) = cells.iter().find(|(cell, _)| self.layout.is_formula(cell)) {
            warn!(
                target = "research.surface",
                cell = %cell,
                "blocked write to formula cell"
            );
            return Err(BridgeError::FormulaCell(cell.to_string()));
        }
        self.surface
            .write_cells(&self.layout.sheet, cells, WriteMode::UserEntered)
            .await?;
        Ok(())
    }

    pub async fn read_inputs(&self) -> Result<SurfaceInputs, BridgeError> {
        let values = self
            .surface
            .read_cells(&self.layout.sheet, &self.layout.input_cells())
            .await?;
        SurfaceInputs::from_values(&values)
    }

    pub async fn clear_inputs(&self) -> Result<(), BridgeError> {
        let cells: Vec<_> = self
            .layout
            .input_cells()
            .into_iter()
            .map(|cell| (cell, CellValue::Empty))
            .collect();
        self.write_guarded(&cells).await
    }

    /// Polls until two consecutive identical readings are valid. Polling
    /// continues until `max_wait` has elapsed; a reading that is valid at
    /// that point gets one confirming read before it is accepted. Anything
    /// else comes back marked invalid.
    pub async fn read_outputs(&self, max_wait: Duration) -> Result<BridgeReading, BridgeError> {
        let started = Instant::now();
        let mut previous: Option<SurfaceOutputs> = None;
        let mut polls = 0u32;
        loop {
            let remaining = max_wait.saturating_sub(started.elapsed());
            let nap = if previous.is_none() {
                self.poll_interval
            } else {
                self.poll_interval.min(remaining).max(Duration::from_millis(1))
            };
            sleep(nap).await;
            let outputs = self.read_output_cells().await?;
            polls += 1;
            let validity = outputs.validity();
            if validity.is_valid() && previous.as_ref() == Some(&outputs) {
                return Ok(self.settled(outputs, polls, started));
            }
            if started.elapsed() < max_wait {
                previous = Some(outputs);
                continue;
            }

            let (outputs, reason) = match validity {
                Validity::Invalid { reason } => (outputs, reason),
                Validity::Valid => {
                    let confirm = self.read_output_cells().await?;
                    polls += 1;
                    if confirm == outputs {
                        return Ok(self.settled(confirm, polls, started));
                    }
                    (confirm, "outputs still changing".to_string())
                }
            };
            return Ok(BridgeReading {
                outputs,
                validity: Validity::Invalid {
                    reason: format!(
                        "propagation wait of {}ms expired: {reason}",
                        max_wait.as_millis()
                    ),
                },
                polls,
            });
        }
    }

    async fn read_output_cells(&self) -> Result<SurfaceOutputs, BridgeError> {
        let values = self
            .surface
            .read_cells(&self.layout.sheet, &self.layout.output_cells())
            .await?;
        SurfaceOutputs::from_values(values)
    }

    fn settled(&self, outputs: SurfaceOutputs, polls: u32, started: Instant) -> BridgeReading {
        debug!(
            target = "research.surface",
            row = self.layout.row,
            polls,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "outputs settled"
        );
        BridgeReading {
            outputs,
            validity: Validity::Valid,
            polls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeeConfig;
    use crate::surface::SimulatedSurface;

    fn bridge(surface: Arc<SimulatedSurface>) -> CalculationBridge {
        let layout = SurfaceLayout::at_row("search_base", 10).expect("layout");
        CalculationBridge::new(surface, layout, Duration::from_millis(10))
    }

    fn sample_inputs() -> SurfaceInputs {
        SurfaceInputs {
            weight_g: Some(450),
            dimensions_cm: Some([20.0, 15.0, 8.0]),
            item_url: Some("https://www.ebay.com/itm/1234567890".into()),
            category_id: Some("261068".into()),
            ..SurfaceInputs::new(5000.4, 49.96, 0.0)
        }
    }

    #[test]
    fn layout_places_cells_around_the_scratch_row() {
        let layout = SurfaceLayout::at_row("search_base", 10).expect("layout");
        assert_eq!(layout.source_price.to_string(), "B10");
        assert_eq!(layout.item_url.to_string(), "K9");
        assert_eq!(layout.category_id.to_string(), "K11");
        assert_eq!(layout.profit_with_rebate.to_string(), "P13");
        assert!(layout.is_formula(&CellRef::new("E", 10)));
        assert!(layout.is_formula(&CellRef::new("J", 10)));
        assert!(!layout.is_formula(&CellRef::new("B", 10)));
        assert!(SurfaceLayout::at_row("search_base", 1).is_err());
    }

    #[test]
    fn rebate_row_collides_three_rows_down() {
        let ten = SurfaceLayout::at_row("s", 10).expect("layout");
        let thirteen = SurfaceLayout::at_row("s", 13).expect("layout");
        let twenty = SurfaceLayout::at_row("s", 20).expect("layout");
        assert!(ten.overlaps(&thirteen));
        assert!(!ten.overlaps(&twenty));
    }

    #[test]
    fn inputs_are_rounded_for_their_cells() {
        let inputs = SurfaceInputs::new(5000.4, 49.96, 12.34);
        assert_eq!(inputs.source_price, 5000);
        assert_eq!(inputs.sell_price, 50.0);
        assert_eq!(inputs.listing_shipping, 12.3);
    }

    #[tokio::test]
    async fn written_inputs_read_back_unchanged() {
        let surface = Arc::new(SimulatedSurface::new(
            FeeConfig::default(),
            Duration::from_millis(0),
        ));
        let bridge = bridge(surface);
        let inputs = sample_inputs();
        bridge.write_inputs(&inputs).await.expect("write");
        let read = bridge.read_inputs().await.expect("read");
        assert_eq!(read, inputs);
    }

    #[tokio::test]
    async fn absent_optionals_clear_previous_values() {
        let surface = Arc::new(SimulatedSurface::new(
            FeeConfig::default(),
            Duration::from_millis(0),
        ));
        let bridge = bridge(surface);
        bridge.write_inputs(&sample_inputs()).await.expect("first");
        let bare = SurfaceInputs::new(3000.0, 30.0, 0.0);
        bridge.write_inputs(&bare).await.expect("second");
        let read = bridge.read_inputs().await.expect("read");
        assert_eq!(read, bare);
        assert!(read.category_id.is_none());
        assert!(read.weight_g.is_none());
    }

    #[tokio::test]
    async fn formula_cells_are_never_written() {
        let surface = Arc::new(SimulatedSurface::new(
            FeeConfig::default(),
            Duration::from_millis(0),
        ));
        let bridge = bridge(surface.clone());
        let err = bridge
            .write_guarded(&[
                (CellRef::new("B", 10), CellValue::Number(1.0)),
                (CellRef::new("E", 10), CellValue::Number(2.0)),
            ])
            .await
            .expect_err("formula write");
        assert_eq!(err, BridgeError::FormulaCell("E10".into()));
        // the batch was rejected as a whole
        assert_eq!(surface.write_count(), 0);
    }

    #[tokio::test]
    async fn settled_outputs_are_valid() {
        let surface = Arc::new(SimulatedSurface::new(
            FeeConfig::default(),
            Duration::from_millis(15),
        ));
        let bridge = bridge(surface);
        bridge
            .write_inputs(&sample_inputs())
            .await
            .expect("write inputs");
        let reading = bridge
            .read_outputs(Duration::from_millis(500))
            .await
            .expect("read outputs");
        assert!(reading.validity.is_valid(), "{:?}", reading.validity);
        assert!(reading.polls >= 2);
        let result = reading.outputs.to_profit_result().expect("profit");
        assert_eq!(result.source, ProfitSource::Surface);
        assert!(result.carrier.is_some());
    }

    #[tokio::test]
    async fn idle_row_expires_as_invalid() {
        let surface = Arc::new(SimulatedSurface::new(
            FeeConfig::default(),
            Duration::from_millis(0),
        ));
        let bridge = bridge(surface);
        let reading = bridge
            .read_outputs(Duration::from_millis(50))
            .await
            .expect("read outputs");
        match reading.validity {
            Validity::Invalid { reason } => assert!(reason.contains("empty"), "{reason}"),
            Validity::Valid => panic!("idle row must not validate"),
        }
    }

    #[tokio::test]
    async fn valid_reading_is_kept_when_the_wait_is_short() {
        let surface = Arc::new(SimulatedSurface::new(
            FeeConfig::default(),
            Duration::from_millis(0),
        ));
        let layout = SurfaceLayout::at_row("search_base", 10).expect("layout");
        let bridge = CalculationBridge::new(surface, layout, Duration::from_millis(50));
        bridge
            .write_inputs(&sample_inputs())
            .await
            .expect("write inputs");
        let started = Instant::now();
        let reading = bridge
            .read_outputs(Duration::from_millis(80))
            .await
            .expect("read outputs");
        assert!(reading.validity.is_valid(), "{:?}", reading.validity);
        assert!(reading.polls >= 2);
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn apostrophe_prefixed_text_is_numeric() {
        assert_eq!(
            parse_numeric("profit", &CellValue::Text("'1500".into())),
            Ok(1500.0)
        );
        assert_eq!(
            parse_numeric("margin", &CellValue::Text(" '-12% ".into())),
            Ok(-12.0)
        );
        assert!(parse_numeric("profit", &CellValue::Text("'".into())).is_err());
    }

    #[test]
    fn zero_sentinel_and_text_outputs_are_invalid() {
        let outputs = SurfaceOutputs {
            carrier: CellValue::Empty,
            shipping_method: CellValue::Empty,
            profit: CellValue::Number(0.0),
            margin: CellValue::Number(0.0),
            profit_with_rebate: CellValue::Number(120.0),
            margin_with_rebate: CellValue::Number(3.0),
        };
        assert!(!outputs.validity().is_valid());

        let broken = SurfaceOutputs {
            profit: CellValue::Text("#VALUE!".into()),
            margin: CellValue::Number(10.0),
            ..outputs.clone()
        };
        match broken.validity() {
            Validity::Invalid { reason } => assert!(reason.contains("non-numeric")),
            Validity::Valid => panic!("text output must not validate"),
        }

        let formatted = SurfaceOutputs {
            profit: CellValue::Text("1,234円".into()),
            margin: CellValue::Text("12%".into()),
            ..outputs
        };
        let result = formatted.to_profit_result().expect("formatted numbers");
        assert_eq!(result.profit_amount, 1234);
        assert_eq!(result.profit_margin_pct, 12);
    }
}
