use super::{CalculationSurface, CellRef, CellValue, SurfaceError, WriteMode};
use crate::config::FeeConfig;
use crate::profit::fallback;
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};
use tokio::time::{Duration, Instant};

const INPUT_COLUMNS: [&str; 7] = ["B", "C", "D", "F", "G", "H", "I"];
const FORMULA_COLUMNS: [&str; 2] = ["E", "J"];
const LOADING: &str = "Loading...";
const FORMULA_ERROR: &str = "#VALUE!";

struct Band {
    max_g: f64,
    carrier: &'static str,
    method: &'static str,
    cost: f64,
}

const BANDS: [Band; 3] = [
    Band {
        max_g: 500.0,
        carrier: "Japan Post",
        method: "Small Packet Air",
        cost: 1200.0,
    },
    Band {
        max_g: 2000.0,
        carrier: "Japan Post",
        method: "EMS",
        cost: 3000.0,
    },
    Band {
        max_g: f64::MAX,
        carrier: "FedEx",
        method: "International Economy",
        cost: 5000.0,
    },
];

/// In-process calculation surface with the same cell protocol as the hosted
/// sheet. Outputs appear only after `propagation` has passed since the last
/// write to a row, formula columns reject writes, and raw-mode numbers are
/// stored as text (which breaks the formulas the way a raw write does on the
/// real sheet).
pub struct SimulatedSurface {
    fees: FeeConfig,
    propagation: Duration,
    state: Mutex<SimState>,
    writes: AtomicUsize,
}

#[derive(Default)]
struct SimState {
    cells: HashMap<(String, CellRef), CellValue>,
    scratch_rows: HashSet<(String, u32)>,
    last_write: HashMap<(String, u32), Instant>,
}

#[derive(Debug, Clone)]
struct Evaluated {
    carrier: CellValue,
    method: CellValue,
    profit: CellValue,
    margin: CellValue,
    profit_with_rebate: CellValue,
    margin_with_rebate: CellValue,
    applied_weight: CellValue,
    total_cost: CellValue,
}

impl Evaluated {
    fn filled(value: CellValue) -> Self {
        Self {
            carrier: CellValue::Empty,
            method: CellValue::Empty,
            profit: value.clone(),
            margin: value.clone(),
            profit_with_rebate: value.clone(),
            margin_with_rebate: value.clone(),
            applied_weight: value.clone(),
            total_cost: value,
        }
    }
}

impl SimulatedSurface {
    pub fn new(fees: FeeConfig, propagation: Duration) -> Self {
        Self {
            fees,
            propagation,
            state: Mutex::new(SimState::default()),
            writes: AtomicUsize::new(0),
        }
    }

    /// Number of accepted write batches.
    #[cfg(test)]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn evaluate(&self, state: &SimState, sheet: &str, row: u32) -> Evaluated {
        let key = (sheet.to_string(), row);
        if let Some(written) = state.last_write.get(&key)
            && written.elapsed() < self.propagation
        {
            return Evaluated::filled(CellValue::Text(LOADING.into()));
        }
        let cell = |column: &'static str| {
            state
                .cells
                .get(&(sheet.to_string(), CellRef::new(column, row)))
                .cloned()
                .unwrap_or(CellValue::Empty)
        };
        let mut numbers = HashMap::new();
        for column in INPUT_COLUMNS {
            match cell(column) {
                CellValue::Empty => {}
                CellValue::Number(n) => {
                    numbers.insert(column, n);
                }
                CellValue::Text(_) => return Evaluated::filled(CellValue::Text(FORMULA_ERROR.into())),
            }
        }
        let (Some(source), Some(sell)) = (numbers.get("B"), numbers.get("C")) else {
            return Evaluated::filled(CellValue::Empty);
        };
        let listing_shipping = numbers.get("D").copied().unwrap_or(0.0);
        let actual = numbers.get("F").copied().unwrap_or(0.0);
        let volumetric = match (numbers.get("G"), numbers.get("H"), numbers.get("I")) {
            (Some(d), Some(w), Some(h)) => d * w * h / 5000.0 * 1000.0,
            _ => 0.0,
        };
        let applied = actual.max(volumetric);
        let (carrier, method, shipping) = if applied > 0.0 {
            let band = BANDS
                .iter()
                .find(|band| applied <= band.max_g)
                .unwrap_or(&BANDS[BANDS.len() - 1]);
            (band.carrier, band.method, band.cost)
        } else {
            ("Japan Post", "EMS", self.fees.outbound_shipping)
        };
        match fallback::compute(*source, sell + listing_shipping, shipping, &self.fees) {
            Ok(result) => Evaluated {
                carrier: CellValue::Text(carrier.into()),
                method: CellValue::Text(method.into()),
                profit: CellValue::Number(result.profit_amount as f64),
                margin: CellValue::Number(f64::from(result.profit_margin_pct)),
                profit_with_rebate: CellValue::Number(result.profit_amount_with_rebate as f64),
                margin_with_rebate: CellValue::Number(f64::from(
                    result.profit_margin_pct_with_rebate,
                )),
                applied_weight: CellValue::Number(applied.round()),
                total_cost: CellValue::Number((source + shipping).round()),
            },
            Err(_) => Evaluated::filled(CellValue::Text(FORMULA_ERROR.into())),
        }
    }

    fn read_one(&self, state: &SimState, sheet: &str, cell: &CellRef) -> CellValue {
        let is_scratch = |row: u32| state.scratch_rows.contains(&(sheet.to_string(), row));
        match cell.column {
            "N" | "O" | "E" | "J" if is_scratch(cell.row) => {
                let evaluated = self.evaluate(state, sheet, cell.row);
                match cell.column {
                    "N" => evaluated.carrier,
                    "O" => evaluated.method,
                    "E" => evaluated.applied_weight,
                    _ => evaluated.total_cost,
                }
            }
            "P" | "Q" if is_scratch(cell.row) => {
                let evaluated = self.evaluate(state, sheet, cell.row);
                if cell.column == "P" {
                    evaluated.profit
                } else {
                    evaluated.margin
                }
            }
            "P" | "Q" if cell.row > 3 && is_scratch(cell.row - 3) => {
                let evaluated = self.evaluate(state, sheet, cell.row - 3);
                if cell.column == "P" {
                    evaluated.profit_with_rebate
                } else {
                    evaluated.margin_with_rebate
                }
            }
            _ => state
                .cells
                .get(&(sheet.to_string(), cell.clone()))
                .cloned()
                .unwrap_or(CellValue::Empty),
        }
    }
}

#[async_trait]
impl CalculationSurface for SimulatedSurface {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn write_cells(
        &self,
        sheet: &str,
        cells: &[(CellRef, CellValue)],
        mode: WriteMode,
    ) -> Result<(), SurfaceError> {
        if let Some((cell, _)) = cells
            .iter()
            .find(|(cell, _)| FORMULA_COLUMNS.contains(&cell.column))
        {
            return Err(SurfaceError::Protected(cell.to_string()));
        }
        let now = Instant::now();
        let mut state = self.lock();
        for (cell, value) in cells {
            let stored = match (mode, value) {
                (WriteMode::Raw, CellValue::Number(n)) => CellValue::Text(n.to_string()),
                _ => value.clone(),
            };
            if INPUT_COLUMNS.contains(&cell.column) {
                let key = (sheet.to_string(), cell.row);
                state.scratch_rows.insert(key.clone());
                state.last_write.insert(key, now);
            }
            state.cells.insert((sheet.to_string(), cell.clone()), stored);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_cells(
        &self,
        sheet: &str,
        cells: &[CellRef],
    ) -> Result<Vec<CellValue>, SurfaceError> {
        let state = self.lock();
        Ok(cells
            .iter()
            .map(|cell| self.read_one(&state, sheet, cell))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(cells: &[(&'static str, u32, CellValue)]) -> Vec<(CellRef, CellValue)> {
        cells
            .iter()
            .map(|(col, row, value)| (CellRef::new(*col, *row), value.clone()))
            .collect()
    }

    #[tokio::test]
    async fn formula_columns_are_protected() {
        let surface = SimulatedSurface::new(FeeConfig::default(), Duration::ZERO);
        let err = surface
            .write_cells(
                "s",
                &write(&[("J", 10, CellValue::Number(1.0))]),
                WriteMode::UserEntered,
            )
            .await
            .expect_err("protected");
        assert_eq!(err, SurfaceError::Protected("J10".into()));
    }

    #[tokio::test]
    async fn raw_numbers_break_the_formulas() {
        let surface = SimulatedSurface::new(FeeConfig::default(), Duration::ZERO);
        surface
            .write_cells(
                "s",
                &write(&[
                    ("B", 10, CellValue::Number(5000.0)),
                    ("C", 10, CellValue::Number(50.0)),
                ]),
                WriteMode::Raw,
            )
            .await
            .expect("raw write");
        let values = surface
            .read_cells("s", &[CellRef::new("B", 10), CellRef::new("P", 10)])
            .await
            .expect("read");
        assert_eq!(values[0], CellValue::Text("5000".into()));
        assert_eq!(values[1], CellValue::Text(FORMULA_ERROR.into()));
    }

    #[tokio::test]
    async fn outputs_follow_inputs_after_propagation() {
        let surface = SimulatedSurface::new(FeeConfig::default(), Duration::from_millis(20));
        surface
            .write_cells(
                "s",
                &write(&[
                    ("B", 10, CellValue::Number(5000.0)),
                    ("C", 10, CellValue::Number(50.0)),
                    ("D", 10, CellValue::Number(0.0)),
                ]),
                WriteMode::UserEntered,
            )
            .await
            .expect("write");
        let cells = [CellRef::new("P", 10), CellRef::new("P", 13)];
        let early = surface.read_cells("s", &cells).await.expect("early");
        assert_eq!(early[0], CellValue::Text(LOADING.into()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let settled = surface.read_cells("s", &cells).await.expect("settled");
        // no weight: default outbound shipping of 800
        assert_eq!(settled[0], CellValue::Number(755.0));
        assert_eq!(settled[1], CellValue::Number(1210.0));
    }
}
