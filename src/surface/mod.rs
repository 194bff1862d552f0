pub mod bridge;
pub mod pool;
pub mod sheets;
pub mod simulated;

pub use bridge::{
    BridgeError, BridgeReading, CalculationBridge, SurfaceInputs, SurfaceLayout, SurfaceOutputs,
    Validity,
};
pub use pool::{LeaseError, RedisFence, SurfaceLease, SurfacePool};
pub use sheets::SheetsSurface;
pub use simulated::SimulatedSurface;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// A single A1-style cell reference on one sheet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CellRef {
    pub column: &'static str,
    pub row: u32,
}

impl CellRef {
    pub const fn new(column: &'static str, row: u32) -> Self {
        Self { column, row }
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.column, self.row)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    Empty,
    Number(f64),
    Text(String),
}

impl CellValue {
    pub fn is_empty(&self) -> bool {
        match self {
            CellValue::Empty => true,
            CellValue::Text(text) => text.trim().is_empty(),
            CellValue::Number(_) => false,
        }
    }

    pub fn text(&self) -> Option<String> {
        match self {
            CellValue::Empty => None,
            CellValue::Number(n) => Some(n.to_string()),
            CellValue::Text(text) => Some(text.trim().to_string()).filter(|t| !t.is_empty()),
        }
    }
}

/// How the surface should interpret written values. `Raw` stores the literal
/// string and breaks numeric formulas; only `UserEntered` is used by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    UserEntered,
    Raw,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::UserEntered => "USER_ENTERED",
            WriteMode::Raw => "RAW",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SurfaceError {
    #[error("surface transport failed: {0}")]
    Transport(String),
    #[error("cell {0} is protected")]
    Protected(String),
    #[error("unexpected surface response: {0}")]
    Malformed(String),
}

/// Cell-level protocol of the external calculation surface.
#[async_trait]
pub trait CalculationSurface: Send + Sync {
    fn name(&self) -> &'static str;

    async fn write_cells(
        &self,
        sheet: &str,
        cells: &[(CellRef, CellValue)],
        mode: WriteMode,
    ) -> Result<(), SurfaceError>;

    /// Returns one value per requested cell, in request order.
    async fn read_cells(&self, sheet: &str, cells: &[CellRef])
    -> Result<Vec<CellValue>, SurfaceError>;
}
