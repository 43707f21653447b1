//! Per-layer Q tables
//!
//! Three little-endian `i32` files sit next to the fixed-point weights:
//!
//! | File | Entries |
//! |------|---------|
//! | `weight_int16_Q.bin` | one per conv |
//! | `bias_int16_Q.bin` | one per conv |
//! | `iofm_Q.bin` | one per conv, plus one for the network input |
//!
//! `iofm[o]` is the input Q of conv `o` and `iofm[o + 1]` its output Q.

use crate::error::{ModelError, Result};
use std::path::Path;
use yolo2_chip::QValues;

/// Weight Q file name
pub const WEIGHT_Q_FILE: &str = "weight_int16_Q.bin";
/// Bias Q file name
pub const BIAS_Q_FILE: &str = "bias_int16_Q.bin";
/// Activation Q file name
pub const ACT_Q_FILE: &str = "iofm_Q.bin";

/// Q tables indexed by conv ordinal
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuantTables {
    /// Weight Q per conv.
    pub weight: Vec<i32>,
    /// Bias Q per conv.
    pub bias: Vec<i32>,
    /// Activation Q, `conv_count + 1` entries.
    pub act: Vec<i32>,
}

impl QuantTables {
    /// Tables that resolve every Q to zero (the float path).
    pub fn zero() -> Self {
        Self::default()
    }

    /// Load the three tables from `dir`.
    ///
    /// A missing file resolves to Q = 0 for every layer, with a warning.
    /// Short tables are padded by the fallbacks of [`QuantTables::conv`].
    ///
    /// # Errors
    ///
    /// Returns error if a file exists but cannot be read or is not a whole
    /// number of `i32` values.
    pub fn load(dir: impl AsRef<Path>, conv_count: usize) -> Result<Self> {
        let dir = dir.as_ref();
        let tables = Self {
            weight: read_table(&dir.join(WEIGHT_Q_FILE))?,
            bias: read_table(&dir.join(BIAS_Q_FILE))?,
            act: read_table(&dir.join(ACT_Q_FILE))?,
        };
        if tables.weight.len() < conv_count || tables.bias.len() < conv_count || tables.act.len() <= conv_count {
            tracing::warn!(
                "Q tables shorter than {conv_count} convs (weight {}, bias {}, act {}); missing entries use fallbacks",
                tables.weight.len(),
                tables.bias.len(),
                tables.act.len()
            );
        }
        Ok(tables)
    }

    /// Q of the network input
    pub fn input_q(&self) -> i32 {
        self.act.first().copied().unwrap_or(0)
    }

    /// Q values of conv `ordinal`.
    ///
    /// Missing entries fall back to zero, except the output Q, which falls
    /// back to the conv's input Q.
    pub fn conv(&self, ordinal: usize) -> QValues {
        let at = |table: &[i32], i: usize| table.get(i).copied();
        QValues {
            weight: at(&self.weight, ordinal).unwrap_or(0),
            bias: at(&self.bias, ordinal).unwrap_or(0),
            act_in: at(&self.act, ordinal).unwrap_or(0),
            act_out: at(&self.act, ordinal + 1)
                .or_else(|| at(&self.act, ordinal))
                .unwrap_or(0),
        }
    }
}

fn read_table(path: &Path) -> Result<Vec<i32>> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("{} not found; using Q = 0", path.display());
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };
    if bytes.len() % 4 != 0 {
        return Err(ModelError::shape_mismatch(
            format!("{} byte length", path.display()),
            bytes.len() / 4 * 4,
            bytes.len(),
        ));
    }
    let values: Vec<i32> = bytemuck::pod_collect_to_vec(&bytes);
    tracing::debug!("{}: {} entries", path.display(), values.len());
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, values: &[i32]) {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        std::fs::write(dir.join(name), bytes).unwrap();
    }

    #[test]
    fn test_load_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), WEIGHT_Q_FILE, &[14, 15]);
        write(dir.path(), BIAS_Q_FILE, &[12, 11]);
        write(dir.path(), ACT_Q_FILE, &[8, 7, 6]);

        let q = QuantTables::load(dir.path(), 2).unwrap();
        assert_eq!(q.input_q(), 8);
        assert_eq!(
            q.conv(1),
            QValues {
                weight: 15,
                act_in: 7,
                act_out: 6,
                bias: 11
            }
        );
    }

    #[test]
    fn test_missing_files_resolve_to_zero() {
        let dir = tempfile::tempdir().unwrap();
        let q = QuantTables::load(dir.path(), 3).unwrap();
        assert_eq!(q, QuantTables::zero());
        assert_eq!(q.input_q(), 0);
        assert_eq!(q.conv(2), QValues::default());
    }

    #[test]
    fn test_short_act_table_falls_back_to_input_q() {
        let q = QuantTables {
            weight: vec![14],
            bias: vec![],
            act: vec![9, 8],
        };
        let last = q.conv(1);
        assert_eq!((last.weight, last.bias, last.act_in, last.act_out), (0, 0, 8, 8));
        assert_eq!(q.conv(5).act_out, 0);
    }

    #[test]
    fn test_negative_and_wide_entries() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), ACT_Q_FILE, &[-3, 1 << 20, i32::MIN]);
        assert_eq!(read_table(&dir.path().join(ACT_Q_FILE)).unwrap(), vec![-3, 1 << 20, i32::MIN]);
    }

    #[test]
    fn test_partial_value_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ACT_Q_FILE), [1, 0, 0, 0, 2, 0]).unwrap();
        let err = QuantTables::load(dir.path(), 1).unwrap_err();
        assert!(matches!(err, ModelError::ShapeMismatch { actual: 6, .. }));
    }
}
