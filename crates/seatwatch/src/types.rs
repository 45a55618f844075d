//! Core data types shared across the watcher.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// An academic term as listed by the upstream timetable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TermInfo {
    pub id: String,
    pub name: String,
}

impl TermInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Normalized course code, e.g. `COMPSCI 1JC3`.
pub type CourseCode = String;

/// Uppercases a course code and collapses its whitespace to single spaces.
pub fn normalize_course_code(raw: &str) -> CourseCode {
    raw.split_whitespace()
        .map(str::to_uppercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Kind of schedulable block a section belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BlockType {
    Cop,
    Pra,
    Plc,
    Wrk,
    Lab,
    Prj,
    Rsc,
    Sem,
    Fld,
    Sto,
    Ind,
    Lec,
    Tut,
    Exc,
    The,
}

impl BlockType {
    pub const ALL: [BlockType; 15] = [
        BlockType::Cop,
        BlockType::Pra,
        BlockType::Plc,
        BlockType::Wrk,
        BlockType::Lab,
        BlockType::Prj,
        BlockType::Rsc,
        BlockType::Sem,
        BlockType::Fld,
        BlockType::Sto,
        BlockType::Ind,
        BlockType::Lec,
        BlockType::Tut,
        BlockType::Exc,
        BlockType::The,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Cop => "COP",
            BlockType::Pra => "PRA",
            BlockType::Plc => "PLC",
            BlockType::Wrk => "WRK",
            BlockType::Lab => "LAB",
            BlockType::Prj => "PRJ",
            BlockType::Rsc => "RSC",
            BlockType::Sem => "SEM",
            BlockType::Fld => "FLD",
            BlockType::Sto => "STO",
            BlockType::Ind => "IND",
            BlockType::Lec => "LEC",
            BlockType::Tut => "TUT",
            BlockType::Exc => "EXC",
            BlockType::The => "THE",
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        BlockType::ALL
            .into_iter()
            .find(|b| b.as_str() == upper)
            .ok_or_else(|| format!("unknown block type '{s}'"))
    }
}

/// A single section of a course with its live seat count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionInfo {
    pub block_type: BlockType,
    /// Label shown to students, e.g. `C01`
    pub section: String,
    /// Unique per term+course+section; the watch target identity
    pub key: String,
    pub open_seats: u32,
}

impl SectionInfo {
    /// Human readable name such as `LEC C01`.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.block_type, self.section)
    }
}

/// Sections of one course grouped by block type.
pub type CourseSections = HashMap<BlockType, Vec<SectionInfo>>;

/// Result of a batch detail fetch for one term.
pub type CourseDetails = HashMap<CourseCode, CourseSections>;

/// Looks up a section by its key across all block types of a course.
pub fn find_section<'a>(sections: &'a CourseSections, key: &str) -> Option<&'a SectionInfo> {
    sections.values().flatten().find(|s| s.key == key)
}

/// True when at least one course in the result carries a section list.
pub fn details_are_usable(details: &CourseDetails) -> bool {
    details
        .values()
        .any(|blocks| blocks.values().any(|sections| !sections.is_empty()))
}

/// Lifecycle state of a persisted watch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchStatus {
    Pending,
    Notified,
    Error,
}

impl WatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchStatus::Pending => "pending",
            WatchStatus::Notified => "notified",
            WatchStatus::Error => "error",
        }
    }
}

impl fmt::Display for WatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(WatchStatus::Pending),
            "notified" => Ok(WatchStatus::Notified),
            "error" => Ok(WatchStatus::Error),
            other => Err(format!("unknown watch status '{other}'")),
        }
    }
}

/// A persisted request to be emailed when a section opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRequest {
    pub id: i64,
    pub email: String,
    pub term_id: String,
    pub course_code: CourseCode,
    pub section_key: String,
    pub section_display: String,
    pub status: WatchStatus,
    pub created_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub notified_at: Option<DateTime<Utc>>,
}
