//! Gather buffer configuration statements.
//!
//! The controller is configured with plain `gpascii` assignments:
//!
//! ```text
//! gather.enable=0
//! gather.addr[0]=Sys.ServoCount.a
//! gather.addr[1]=Motor[3].Pos.a
//! gather.items=2
//! gather.Period=1
//! gather.enable=1
//! gather.enable=0
//! gather.MaxSamples=1000
//! ```
//!
//! The address table is only writable while the buffer is disabled. Pulsing
//! `gather.enable` to 1 and back makes the controller validate the table right
//! away without starting a capture; arming is left to the caller.

use std::collections::BTreeMap;

use tracing::debug;

use super::error::{GatherError, GatherResult, GatherStep, StepContext};
use crate::comm::{split_assignment, PmacChannel};

/// Namespace prefix of every gather statement.
const PREFIX: &str = "gather";

/// Size of the controller's gather address table.
pub const MAX_GATHER_ITEMS: usize = 128;

/// Encode a gather configuration as an ordered list of statements.
///
/// # Errors
///
/// Returns [`GatherError::InvalidRequest`] for an empty address list or a
/// period of 0.
pub fn encode_settings(
    addresses: &[String],
    period: u32,
    samples: u64,
) -> GatherResult<Vec<String>> {
    if addresses.is_empty() {
        return Err(GatherError::InvalidRequest(
            "At least one gather address is required".to_string(),
        ));
    }
    if period == 0 {
        return Err(GatherError::InvalidRequest(
            "Gather period must be at least 1 servo cycle".to_string(),
        ));
    }

    let mut statements = Vec::with_capacity(addresses.len() + 6);
    statements.push("gather.enable=0".to_string());
    statements.extend(
        addresses
            .iter()
            .enumerate()
            .map(|(i, addr)| format!("gather.addr[{i}]={addr}")),
    );
    statements.push(format!("gather.items={}", addresses.len()));
    statements.push(format!("gather.Period={period}"));
    statements.push("gather.enable=1".to_string());
    statements.push("gather.enable=0".to_string());
    statements.push(format!("gather.MaxSamples={samples}"));
    Ok(statements)
}

/// A decoded setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingValue {
    /// `name=value`
    Scalar(String),
    /// `name[index]=value`, possibly sparse
    Indexed(BTreeMap<usize, String>),
    /// The address table, compacted; missing indices are empty strings
    List(Vec<String>),
}

/// Gather settings read back from a configuration file.
///
/// Keys are lower-cased. Indexed keys are grouped under their base name, so
/// `gather.addr[2]=C` is found under `gather.addr`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatherSettings {
    entries: BTreeMap<String, SettingValue>,
}

impl GatherSettings {
    pub fn get(&self, key: &str) -> Option<&SettingValue> {
        self.entries.get(&key.to_lowercase())
    }

    /// Value of a scalar setting.
    pub fn scalar(&self, key: &str) -> Option<&str> {
        match self.get(key)? {
            SettingValue::Scalar(value) => Some(value),
            _ => None,
        }
    }

    /// Configured addresses in buffer order (empty if none were found).
    pub fn addresses(&self) -> &[String] {
        match self.get("gather.addr") {
            Some(SettingValue::List(addresses)) => addresses,
            _ => &[],
        }
    }

    pub fn items(&self) -> Option<u64> {
        self.parsed("gather.items")
    }

    pub fn period(&self) -> Option<u32> {
        self.parsed("gather.period")
    }

    pub fn max_samples(&self) -> Option<u64> {
        self.parsed("gather.maxsamples")
    }

    pub fn enable(&self) -> Option<u32> {
        self.parsed("gather.enable")
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SettingValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.scalar(key)?.trim().parse().ok()
    }

    fn insert_indexed(&mut self, base: String, index: usize, value: String) {
        let entry = self
            .entries
            .entry(base)
            .or_insert_with(|| SettingValue::Indexed(BTreeMap::new()));
        match entry {
            SettingValue::Indexed(map) => {
                map.insert(index, value);
            }
            other => *other = SettingValue::Indexed(BTreeMap::from([(index, value)])),
        }
    }
}

/// Split `name[n]...` into the name with all numeric subscripts removed and the
/// first subscript. Returns `None` if the key has no numeric subscript.
fn split_index(key: &str) -> Option<(String, usize)> {
    let mut base = String::with_capacity(key.len());
    let mut index = None;
    let mut rest = key;

    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        let digits = after
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(after.len());

        if digits > 0 && after[digits..].starts_with(']') {
            base.push_str(&rest[..open]);
            if index.is_none() {
                index = after[..digits].parse().ok();
            }
            rest = &after[digits + 1..];
        } else {
            base.push_str(&rest[..=open]);
            rest = after;
        }
    }
    base.push_str(rest);

    index.map(|i| (base, i))
}

/// Decode configuration statements.
///
/// Only lines starting with `gather` (any case) that contain `=` are used;
/// everything else is skipped silently.
pub fn decode_settings<I>(lines: I) -> GatherSettings
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut settings = GatherSettings::default();

    for line in lines {
        let line = line.as_ref().trim();
        let Some(head) = line.get(..PREFIX.len()) else {
            continue;
        };
        if !head.eq_ignore_ascii_case(PREFIX) {
            continue;
        }
        let Some((name, value)) = split_assignment(line) else {
            continue;
        };

        let key = name.to_lowercase();
        let value = value.to_string();
        if !key.contains('[') {
            settings.entries.insert(key, SettingValue::Scalar(value));
            continue;
        }
        match split_index(&key) {
            Some((base, index)) => settings.insert_indexed(base, index, value),
            None => {
                settings.entries.insert(key, SettingValue::Scalar(value));
            }
        }
    }

    let compacted = match settings.entries.get("gather.addr") {
        Some(SettingValue::Indexed(map)) => {
            let dropped = map.range(MAX_GATHER_ITEMS..).count();
            if dropped > 0 {
                debug!("Ignoring {dropped} gather addresses past index {}", MAX_GATHER_ITEMS - 1);
            }

            let table = map.range(..MAX_GATHER_ITEMS);
            let len = table.clone().next_back().map_or(0, |(&max, _)| max + 1);
            let mut addresses = vec![String::new(); len];
            for (&index, value) in table {
                addresses[index] = value.clone();
            }
            Some(addresses)
        }
        _ => None,
    };
    if let Some(addresses) = compacted {
        settings
            .entries
            .insert("gather.addr".to_string(), SettingValue::List(addresses));
    }

    settings
}

/// Read and decode a configuration file stored on the controller.
pub fn read_device_settings<C: PmacChannel>(
    channel: &mut C,
    path: &str,
) -> GatherResult<GatherSettings> {
    let lines = channel.read_file(path).during(GatherStep::Download)?;
    Ok(decode_settings(lines))
}
