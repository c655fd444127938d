//! Core collection domain types for RTMS: periods, cells, and the task grid.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "rtms-core";

/// Seoul (25 gu), Gyeonggi (42 si/gu) and Incheon (10 gu/gun) district codes.
pub const CAPITAL_AREA_REGION_CODES: &[&str] = &[
    "11110", "11140", "11170", "11200", "11215", "11230", "11260", "11290", "11305", "11320",
    "11350", "11380", "11410", "11440", "11470", "11500", "11530", "11545", "11560", "11590",
    "11620", "11650", "11680", "11710", "11740", //
    "41111", "41113", "41115", "41117", "41131", "41133", "41135", "41150", "41171", "41173",
    "41190", "41210", "41220", "41250", "41271", "41273", "41281", "41285", "41287", "41290",
    "41310", "41360", "41370", "41390", "41410", "41430", "41450", "41461", "41463", "41465",
    "41480", "41500", "41550", "41570", "41590", "41610", "41630", "41650", "41670", "41800",
    "41820", "41830", //
    "28110", "28140", "28177", "28185", "28200", "28237", "28245", "28260", "28710", "28720",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeriodError {
    #[error("invalid year-month {0:?}: expected YYYYMM")]
    Format(String),
    #[error("month out of range in {0:?}")]
    Month(String),
}

/// Calendar month, rendered upstream-style as `YYYYMM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        (1..=12).contains(&month).then_some(Self { year, month })
    }

    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn current() -> Self {
        Self::of(chrono::Local::now().date_naive())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn succ(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn pred(self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PeriodError::Format(s.to_string()));
        }
        let year: i32 = s[..4].parse().map_err(|_| PeriodError::Format(s.to_string()))?;
        let month: u32 = s[4..].parse().map_err(|_| PeriodError::Format(s.to_string()))?;
        Self::new(year, month).ok_or_else(|| PeriodError::Month(s.to_string()))
    }
}

/// One unit of collection work: a district code and a deal month.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub region_code: String,
    #[serde(with = "year_month_string")]
    pub period: YearMonth,
}

impl Cell {
    pub fn new(region_code: impl Into<String>, period: YearMonth) -> Self {
        Self {
            region_code: region_code.into(),
            period,
        }
    }

    pub fn key(&self) -> CellKey {
        CellKey(format!("{}_{}", self.region_code, self.period))
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.region_code, self.period)
    }
}

/// Checkpoint identity of a cell: `"{regionCode}_{yearMonth}"`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellKey(String);

impl CellKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parse(&self) -> Option<Cell> {
        let (region, period) = self.0.rsplit_once('_')?;
        Some(Cell::new(region, period.parse().ok()?))
    }
}

impl From<String> for CellKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CellKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Cross product of regions and months in `[start, end]`, region-major then
/// chronological. An empty range yields no cells.
pub fn enumerate<S: AsRef<str>>(regions: &[S], start: YearMonth, end: YearMonth) -> Vec<Cell> {
    if start > end {
        return Vec::new();
    }
    let mut months = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        months.push(cursor);
        cursor = cursor.succ();
    }

    regions
        .iter()
        .flat_map(|region| {
            months
                .iter()
                .map(move |period| Cell::new(region.as_ref(), *period))
        })
        .collect()
}

/// Months covered by a backfill of whole years, clipped to `until`.
pub fn backfill_bounds(start_year: i32, end_year: i32, until: YearMonth) -> (YearMonth, YearMonth) {
    let start = YearMonth {
        year: start_year,
        month: 1,
    };
    let end = YearMonth {
        year: end_year,
        month: 12,
    };
    (start, end.min(until))
}

/// Region set loaded from an optional registry file.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionRegistry {
    pub regions: Vec<RegionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionEntry {
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl RegionRegistry {
    pub fn capital_area() -> Self {
        Self {
            regions: CAPITAL_AREA_REGION_CODES
                .iter()
                .map(|code| RegionEntry {
                    code: (*code).to_string(),
                    name: None,
                })
                .collect(),
        }
    }

    pub fn codes(&self) -> Vec<String> {
        self.regions.iter().map(|r| r.code.clone()).collect()
    }

    pub fn label<'a>(&'a self, code: &'a str) -> &'a str {
        self.regions
            .iter()
            .find(|r| r.code == code)
            .and_then(|r| r.name.as_deref())
            .unwrap_or(code)
    }
}

mod year_month_string {
    use super::YearMonth;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &YearMonth, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<YearMonth, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}
