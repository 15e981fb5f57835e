//! Gather result parsing.
//!
//! An uploaded buffer is a text file with one sample per line and one
//! whitespace-separated number per gathered address. Lines with a different
//! token count (headers, truncated lines) are ignored; lines with the right
//! count but a token that is not a number are dropped with a warning.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use ndarray::Array2;
use tracing::{debug, warn};

use super::is_time_source;
use super::plan::ServoClock;

/// Parsed gather rows, aligned with the gathered addresses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedDataset {
    columns: Vec<String>,
    rows: Vec<Vec<f64>>,
    skipped: usize,
    ignored: usize,
}

impl ParsedDataset {
    /// Column names, in gather order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows dropped because a token was not a number.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Lines ignored because their token count did not match.
    pub fn ignored(&self) -> usize {
        self.ignored
    }

    /// All values of one column (name matched case-insensitively).
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))?;
        Some(self.rows.iter().map(|row| row[idx]).collect())
    }

    /// Rows as a `samples x columns` matrix.
    pub fn to_array(&self) -> Array2<f64> {
        Array2::from_shape_fn((self.rows.len(), self.columns.len()), |(i, j)| {
            self.rows[i][j]
        })
    }

    /// Write a header line of column names followed by one line per row.
    pub fn write_delimited(&self, path: &Path, delim: &str) -> std::io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "{}", self.columns.join(delim))?;
        for row in &self.rows {
            let fields: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            writeln!(out, "{}", fields.join(delim))?;
        }
        out.flush()?;

        debug!("Wrote {} rows to {}", self.rows.len(), path.display());
        Ok(())
    }
}

/// Parse one numeric literal: a decimal or `0x` hex integer, or a finite float.
fn parse_literal(token: &str) -> Option<f64> {
    if let Ok(value) = token.parse::<i64>() {
        return Some(value as f64);
    }

    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token.strip_prefix('+').unwrap_or(token)),
    };
    if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let value = i64::from_str_radix(hex, 16).ok()? as f64;
        return Some(if negative { -value } else { value });
    }

    token.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Parse uploaded gather lines into rows.
///
/// If one of `addresses` is the servo tick counter, its column is converted
/// from ticks to seconds with `clock`.
pub fn parse_results<I>(addresses: &[String], lines: I, clock: &ServoClock) -> ParsedDataset
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let count = addresses.len();
    let time_column = addresses.iter().position(|a| is_time_source(a));
    let mut dataset = ParsedDataset {
        columns: addresses.to_vec(),
        ..ParsedDataset::default()
    };

    for line in lines {
        let line = line.as_ref();
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != count {
            dataset.ignored += 1;
            continue;
        }

        let row: Option<Vec<f64>> = tokens.iter().map(|t| parse_literal(t)).collect();
        match row {
            Some(mut row) => {
                if let Some(idx) = time_column {
                    row[idx] *= clock.servo_period();
                }
                dataset.rows.push(row);
            }
            None => {
                warn!("Unable to parse gather results: {line:?}");
                dataset.skipped += 1;
            }
        }
    }

    debug!(
        "Parsed {} gather rows ({} skipped, {} ignored)",
        dataset.rows.len(),
        dataset.skipped,
        dataset.ignored
    );
    dataset
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn addrs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_arity_and_parse_failures() {
        let data = parse_results(&addrs(&["a", "b"]), ["1 2", "3 4 5", "x y"], &ServoClock::default());
        assert_eq!(data.rows(), [vec![1.0, 2.0]]);
        assert_eq!(data.skipped(), 1);
        assert_eq!(data.ignored(), 1);
    }

    #[test]
    fn test_signed_hex_digits_skip_row() {
        let data = parse_results(&addrs(&["a", "b"]), ["0x-5 1", "-0x-5 2", "0x10 3"], &ServoClock::default());
        assert_eq!(data.rows(), [vec![16.0, 3.0]]);
        assert_eq!(data.skipped(), 2);
    }

    #[test]
    fn test_time_column_scaled() {
        let clock = ServoClock::new(0.000442673749446658);
        let data = parse_results(&addrs(&["Sys.ServoCount.a", "v"]), ["100 5.0"], &clock);

        assert_eq!(data.len(), 1);
        assert_relative_eq!(data.rows()[0][0], 100.0 * 0.000442673749446658);
        assert_relative_eq!(data.rows()[0][1], 5.0);
    }

    #[test]
    fn test_time_column_case_insensitive() {
        let clock = ServoClock::new(0.5);
        let data = parse_results(&addrs(&["v", "sys.servocount.a"]), ["1 10"], &clock);
        assert_eq!(data.column("Sys.ServoCount.a"), Some(vec![5.0]));
    }

    #[test]
    fn test_literals() {
        assert_eq!(parse_literal("42"), Some(42.0));
        assert_eq!(parse_literal("-7"), Some(-7.0));
        assert_eq!(parse_literal("1.5e3"), Some(1500.0));
        assert_eq!(parse_literal("2."), Some(2.0));
        assert_eq!(parse_literal("0x1F"), Some(31.0));
        assert_eq!(parse_literal("-0x10"), Some(-16.0));
        assert_eq!(parse_literal("0x-5"), None);
        assert_eq!(parse_literal("-0x-5"), None);
        assert_eq!(parse_literal("0x+5"), None);
        assert_eq!(parse_literal("0x"), None);
        assert_eq!(parse_literal("nan"), None);
        assert_eq!(parse_literal("inf"), None);
        assert_eq!(parse_literal("abc"), None);
    }

    #[test]
    fn test_row_order_and_header() {
        let lines = ["a b", "3 4", "1 2", "", "5 6"];
        let data = parse_results(&addrs(&["a", "b"]), lines, &ServoClock::default());
        // The header has the right arity but is not numeric
        assert_eq!(data.skipped(), 1);
        assert_eq!(data.column("b"), Some(vec![4.0, 2.0, 6.0]));
        assert_eq!(data.column("missing"), None);
    }

    #[test]
    fn test_to_array() {
        let data = parse_results(&addrs(&["a", "b"]), ["1 2", "3 4"], &ServoClock::default());
        let array = data.to_array();
        assert_eq!(array.shape(), &[2, 2]);
        assert_eq!(array[[1, 0]], 3.0);
    }

    #[test]
    fn test_write_delimited() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gather.txt");

        let data = parse_results(&addrs(&["a", "b"]), ["1 2.5", "3 4"], &ServoClock::default());
        data.write_delimited(&path, "\t").unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "a\tb\n1\t2.5\n3\t4\n");
    }
}
