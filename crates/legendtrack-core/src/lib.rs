//! Canonical tracker data model: topics, projects, snapshots and the ordering rules
//! that keep exported snapshots deterministic.

use std::cmp::{Ordering, Reverse};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "legendtrack-core";

pub const TOPICS_SHEET: &str = "Topics";
pub const PROJECTS_SHEET: &str = "Projects & Experiments";

/// One learning unit, as exported to `topics.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub id: String,
    pub epoch: Option<i64>,
    pub epoch_theme: String,
    pub track: String,
    pub track_title: String,
    pub topic_name: String,
    pub description: String,
    pub depth_target: String,
    pub current_depth: String,
    pub status: String,
    pub last_worked_on: String,
    pub example_project: String,
    pub concept_evidence: String,
    pub implementation_evidence: String,
    pub application_evidence: String,
    pub related_topic_ids: String,
    pub notes: String,
    pub resources: String,
}

impl Topic {
    pub fn sort_key(&self) -> TopicSortKey {
        TopicSortKey::parse(&self.id)
    }

    pub fn canonical_status(&self) -> TopicStatus {
        TopicStatus::canonicalize(&self.status)
    }

    pub fn depth_delta(&self) -> DepthDelta {
        DepthDelta::derive(&self.depth_target, &self.current_depth)
    }

    pub fn related_ids(&self) -> Vec<&str> {
        split_id_list(&self.related_topic_ids)
    }

    /// Number of evidence columns (concept, implementation, application) with any text.
    pub fn evidence_count(&self) -> usize {
        [
            &self.concept_evidence,
            &self.implementation_evidence,
            &self.application_evidence,
        ]
        .iter()
        .filter(|v| !v.trim().is_empty())
        .count()
    }
}

/// One logged project or experiment, as exported to `projects.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub topic_ids: String,
    pub status: String,
    pub start_date: String,
    pub end_date: String,
    pub outcomes: String,
    pub resources: String,
}

impl Project {
    pub fn topic_ids(&self) -> Vec<&str> {
        split_id_list(&self.topic_ids)
    }
}

fn split_id_list(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Normalized, sorted view of both sheets at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Snapshot {
    pub topics: Vec<Topic>,
    pub projects: Vec<Project>,
}

impl Snapshot {
    /// Sorts both collections into export order.
    pub fn new(mut topics: Vec<Topic>, mut projects: Vec<Project>) -> Self {
        sort_topics(&mut topics);
        sort_projects(&mut projects);
        Self { topics, projects }
    }

    pub fn summary(&self) -> ProgressSummary {
        ProgressSummary::from_topics(&self.topics)
    }
}

/// Fields the sync service is allowed to write back into the `Topics` sheet.
///
/// Unknown keys in a request body are dropped during deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TopicUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth_target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_depth: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl TopicUpdate {
    /// Header name paired with the requested value, in sheet write order.
    pub fn columns(&self) -> [(&'static str, Option<&str>); 3] {
        [
            (topic_columns::DEPTH_TARGET, self.depth_target.as_deref()),
            (topic_columns::CURRENT_DEPTH, self.current_depth.as_deref()),
            (topic_columns::STATUS, self.status.as_deref()),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.columns().iter().all(|(_, value)| value.is_none())
    }
}

pub mod topic_columns {
    pub const ID: &str = "ID";
    pub const EPOCH: &str = "Epoch";
    pub const EPOCH_THEME: &str = "Epoch Theme";
    pub const TRACK: &str = "Track";
    pub const TRACK_TITLE: &str = "Track Title";
    pub const TOPIC_NAME: &str = "Topic Name";
    pub const DESCRIPTION: &str = "Description";
    pub const DEPTH_TARGET: &str = "Depth Target (L1-L4)";
    pub const CURRENT_DEPTH: &str = "Current Depth";
    pub const STATUS: &str = "Status";
    pub const LAST_WORKED_ON: &str = "Last Worked On";
    pub const EXAMPLE_PROJECT: &str = "Example Project";
    pub const CONCEPT_EVIDENCE: &str = "Concept Evidence";
    pub const IMPLEMENTATION_EVIDENCE: &str = "Implementation Evidence";
    pub const APPLICATION_EVIDENCE: &str = "Application Evidence";
    pub const RELATED_TOPIC_IDS: &str = "Related Topic IDs";
    pub const NOTES: &str = "Notes / Questions";
    pub const RESOURCES: &str = "Resources Used";
}

pub mod project_columns {
    pub const ID: &str = "Project ID";
    pub const TITLE: &str = "Project / Experiment";
    pub const SUMMARY: &str = "Summary / Goal";
    pub const TOPIC_IDS: &str = "Topic IDs Covered";
    pub const STATUS: &str = "Status";
    pub const START_DATE: &str = "Start Date";
    pub const END_DATE: &str = "End Date";
    pub const OUTCOMES: &str = "Outcomes / Next Actions";
    pub const RESOURCES: &str = "Resources / Links";
}

/// Ordering key derived from a structured topic id such as `E1-A-3`.
///
/// Ids that do not match the pattern get `u64::MAX` components and therefore sort after
/// every structured id, falling back to the raw string among themselves.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TopicSortKey {
    pub epoch: u64,
    pub track: u64,
    pub index: u64,
    pub raw: String,
}

fn topic_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^E([0-9]+)[-–]([A-Z])[-–]([0-9]+)$").expect("topic id pattern compiles")
    })
}

impl TopicSortKey {
    pub fn parse(id: &str) -> Self {
        let unparsed = Self {
            epoch: u64::MAX,
            track: u64::MAX,
            index: u64::MAX,
            raw: id.to_string(),
        };
        let Some(caps) = topic_id_pattern().captures(id) else {
            return unparsed;
        };
        let Some(letter) = caps[2].chars().next().filter(char::is_ascii_alphabetic) else {
            return unparsed;
        };
        Self {
            epoch: caps[1].parse().unwrap_or(u64::MAX),
            track: u64::from(letter.to_ascii_uppercase() as u8 - b'A' + 1),
            index: caps[3].parse().unwrap_or(u64::MAX),
            raw: id.to_string(),
        }
    }

    pub fn is_structured(&self) -> bool {
        self.epoch != u64::MAX || self.track != u64::MAX || self.index != u64::MAX
    }
}

pub fn compare_topic_ids(a: &str, b: &str) -> Ordering {
    TopicSortKey::parse(a).cmp(&TopicSortKey::parse(b))
}

pub fn sort_topics(topics: &mut [Topic]) {
    topics.sort_by_cached_key(Topic::sort_key);
}

/// Case-insensitive title order; titles differing only in case put lowercase first, as
/// locale collation does.
pub fn sort_projects(projects: &mut [Project]) {
    projects.sort_by_cached_key(|p| (p.title.to_lowercase(), Reverse(p.title.clone())));
}

/// Display-time status buckets; free-form sheet values collapse onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TopicStatus {
    #[serde(rename = "Not Started")]
    NotStarted,
    #[serde(rename = "In Progress")]
    InProgress,
    #[serde(rename = "Stable")]
    Stable,
    #[serde(rename = "Mastered")]
    Mastered,
}

impl TopicStatus {
    pub const ALL: [TopicStatus; 4] = [
        TopicStatus::NotStarted,
        TopicStatus::InProgress,
        TopicStatus::Stable,
        TopicStatus::Mastered,
    ];

    pub fn label(self) -> &'static str {
        match self {
            TopicStatus::NotStarted => "Not Started",
            TopicStatus::InProgress => "In Progress",
            TopicStatus::Stable => "Stable",
            TopicStatus::Mastered => "Mastered",
        }
    }

    pub fn canonicalize(raw: &str) -> Self {
        let needle = raw.trim();
        Self::ALL
            .into_iter()
            .find(|status| status.label().eq_ignore_ascii_case(needle))
            .unwrap_or(TopicStatus::NotStarted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DepthState {
    Under,
    OnTrack,
    Ahead,
    Unset,
}

/// Gap between a topic's target depth (`L1`..`L4`) and its current depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthDelta {
    pub target_level: u8,
    pub current_level: u8,
    pub delta: i8,
    pub steps_needed: u8,
    pub state: DepthState,
}

fn depth_level_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)L\s*([1-4])").expect("depth level pattern compiles"))
}

/// `0` when the label carries no `L1`..`L4` marker.
pub fn parse_depth_level(label: &str) -> u8 {
    depth_level_pattern()
        .captures(label.trim())
        .and_then(|caps| caps[1].parse().ok())
        .unwrap_or(0)
}

impl DepthDelta {
    pub fn derive(depth_target: &str, current_depth: &str) -> Self {
        let target_level = parse_depth_level(depth_target);
        let current_level = parse_depth_level(current_depth);
        let delta = target_level as i8 - current_level as i8;
        let state = if target_level == 0 {
            DepthState::Unset
        } else if current_level == 0 || current_level < target_level {
            DepthState::Under
        } else if current_level == target_level {
            DepthState::OnTrack
        } else {
            DepthState::Ahead
        };
        Self {
            target_level,
            current_level,
            delta,
            steps_needed: delta.unsigned_abs(),
            state,
        }
    }

    pub fn message(&self) -> String {
        let unit = if self.steps_needed == 1 { "level" } else { "levels" };
        match self.state {
            DepthState::Unset => "Set a depth target".to_string(),
            DepthState::OnTrack => "On target".to_string(),
            DepthState::Under => format!("Needs +{} {unit}", self.steps_needed),
            DepthState::Ahead => format!("Ahead by {} {unit}", self.steps_needed),
        }
    }
}

/// Aggregate progress figures for a set of topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub total: usize,
    pub status_counts: BTreeMap<TopicStatus, usize>,
    pub depth_states: BTreeMap<DepthState, usize>,
    pub mastered_percent: u8,
}

impl ProgressSummary {
    pub fn from_topics(topics: &[Topic]) -> Self {
        let mut status_counts: BTreeMap<TopicStatus, usize> =
            TopicStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        let mut depth_states = BTreeMap::new();
        for topic in topics {
            *status_counts.entry(topic.canonical_status()).or_default() += 1;
            *depth_states.entry(topic.depth_delta().state).or_default() += 1;
        }
        let mastered = status_counts[&TopicStatus::Mastered];
        let mastered_percent = if topics.is_empty() {
            0
        } else {
            ((mastered as f64 / topics.len() as f64) * 100.0).round() as u8
        };
        Self {
            total: topics.len(),
            status_counts,
            depth_states,
            mastered_percent,
        }
    }
}
