//! Robot capability advertisement and identity validation.
//!
//! Pure functions and constants shared by the direct-queue worker and the
//! tunnel agent.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Longest robot name the control plane stores.
pub const MAX_ROBOT_NAME_LEN: usize = 128;

/// Most routing tags a robot may advertise.
const MAX_TAGS: usize = 32;

/// Longest tag or browser label.
const MAX_LABEL_LEN: usize = 64;

const BYTES_PER_KB: u64 = 1024;

/// How a robot is operated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RobotType {
    /// Runs jobs without a user at the machine.
    Unattended,
    /// Runs jobs on behalf of a logged-in user.
    Attended,
    /// Either, depending on the job.
    Hybrid,
}

impl std::str::FromStr for RobotType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unattended" => Ok(Self::Unattended),
            "attended" => Ok(Self::Attended),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(CoreError::Validation(format!("Unknown robot type '{other}'"))),
        }
    }
}

/// What a robot can run, sent to the control plane on registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RobotCapabilities {
    pub robot_type: RobotType,
    pub supported_browsers: Vec<String>,
    pub desktop_supported: bool,
    pub max_concurrent_jobs: u32,
    pub tags: Vec<String>,
    pub os_info: String,
    pub memory_mb: u64,
    pub cpu_cores: u32,
}

impl Default for RobotCapabilities {
    fn default() -> Self {
        Self {
            robot_type: RobotType::Unattended,
            supported_browsers: vec!["chromium".to_string()],
            desktop_supported: false,
            max_concurrent_jobs: 1,
            tags: Vec::new(),
            os_info: String::new(),
            memory_mb: 0,
            cpu_cores: 0,
        }
    }
}

impl RobotCapabilities {
    /// Defaults with host facts (OS, cores, memory) filled in.
    pub fn detect() -> Self {
        Self {
            os_info: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            cpu_cores: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1),
            memory_mb: detect_memory_mb().unwrap_or(0),
            ..Self::default()
        }
    }

    /// Trim and lowercase tags and browser names, dropping blanks and
    /// repeats. First-seen order is kept.
    pub fn normalize(&mut self) {
        self.tags = normalized_labels(&self.tags);
        self.supported_browsers = normalized_labels(&self.supported_browsers);
    }

    /// Check what the control plane matches jobs against. Labels must
    /// already be normalized.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_concurrent_jobs == 0 {
            return Err(CoreError::Validation(
                "max_concurrent_jobs must be at least 1".to_string(),
            ));
        }
        if self.tags.len() > MAX_TAGS {
            return Err(CoreError::Validation(format!(
                "A robot may advertise at most {MAX_TAGS} tags (got {})",
                self.tags.len()
            )));
        }
        check_labels("Tag", &self.tags)?;
        check_labels("Browser", &self.supported_browsers)
    }
}

fn normalized_labels(labels: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(labels.len());
    for label in labels {
        let label = label.trim().to_ascii_lowercase();
        if !label.is_empty() && !out.contains(&label) {
            out.push(label);
        }
    }
    out
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | ':' | '.')
}

fn check_labels(kind: &str, labels: &[String]) -> Result<(), CoreError> {
    for (i, label) in labels.iter().enumerate() {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(CoreError::Validation(format!(
                "{kind} '{label}' must be 1 to {MAX_LABEL_LEN} characters"
            )));
        }
        if let Some(c) = label.chars().find(|c| !is_label_char(*c)) {
            return Err(CoreError::Validation(format!(
                "{kind} '{label}' contains '{c}'; labels are lowercase letters, digits, '-', '_', ':' or '.'"
            )));
        }
        if labels[..i].contains(label) {
            return Err(CoreError::Validation(format!("{kind} '{label}' is listed twice")));
        }
    }
    Ok(())
}

/// Total physical memory from `/proc/meminfo`, where the host has one.
fn detect_memory_mb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    parse_meminfo_total_mb(&meminfo)
}

fn parse_meminfo_total_mb(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb / BYTES_PER_KB)
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Robot names are host-name shaped: ASCII letters, digits, `-`, `_` and
/// `.`, starting and ending with a letter or digit.
pub fn validate_robot_name(name: &str) -> Result<(), CoreError> {
    let bounded_by_alnum = name
        .chars()
        .next()
        .zip(name.chars().last())
        .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());
    if !bounded_by_alnum || name.len() > MAX_ROBOT_NAME_LEN || !name.chars().all(is_name_char) {
        return Err(CoreError::Validation(format!(
            "Robot name '{name}' must be 1 to {MAX_ROBOT_NAME_LEN} letters, digits, '-', '_' or '.', \
             starting and ending with a letter or digit"
        )));
    }
    Ok(())
}

/// Robot name derived from a host name: disallowed characters dropped,
/// leading and trailing separators trimmed, cut to the length limit.
/// `None` if nothing usable remains.
pub fn robot_name_from_host(host: &str) -> Option<String> {
    let kept: String = host.chars().filter(|c| is_name_char(*c)).collect();
    let mut name: String = kept
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .chars()
        .take(MAX_ROBOT_NAME_LEN)
        .collect();
    while name.ends_with(|c: char| !c.is_ascii_alphanumeric()) {
        name.pop();
    }
    (!name.is_empty()).then_some(name)
}

/// Split a comma-separated list, trimming and dropping empty entries.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn robot_names_are_host_shaped() {
        assert!(validate_robot_name("robot-01").is_ok());
        assert!(validate_robot_name("bot01.finance.corp").is_ok());
        assert!(validate_robot_name("").is_err());
        assert!(validate_robot_name("robot 01").is_err());
        assert!(validate_robot_name("-robot").is_err());
        assert!(validate_robot_name("robot.").is_err());
        assert!(validate_robot_name("robôt").is_err());
        assert!(validate_robot_name(&"a".repeat(MAX_ROBOT_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn host_names_become_valid_robot_names() {
        assert_eq!(robot_name_from_host("BOT-07.corp").as_deref(), Some("BOT-07.corp"));
        assert_eq!(robot_name_from_host(" _build box!_ ").as_deref(), Some("buildbox"));
        assert_eq!(robot_name_from_host("---"), None);
        let long = format!("{}-tail", "h".repeat(MAX_ROBOT_NAME_LEN - 1));
        let name = robot_name_from_host(&long).unwrap();
        assert!(validate_robot_name(&name).is_ok());
    }

    #[test]
    fn normalize_lowercases_and_dedupes_labels() {
        let mut caps = RobotCapabilities {
            tags: vec![" SAP ".into(), "excel".into(), "sap".into(), "  ".into()],
            supported_browsers: vec!["Chromium".into(), "firefox".into(), "chromium".into()],
            ..Default::default()
        };
        caps.normalize();
        assert_eq!(caps.tags, vec!["sap", "excel"]);
        assert_eq!(caps.supported_browsers, vec!["chromium", "firefox"]);
        assert!(caps.validate().is_ok());
    }

    #[test]
    fn label_rules() {
        let with_tags = |tags: Vec<String>| RobotCapabilities {
            tags,
            ..Default::default()
        };
        assert!(with_tags(vec!["region:eu-1".into()]).validate().is_ok());
        assert!(with_tags(vec!["SAP".into()]).validate().is_err());
        assert!(with_tags(vec!["sap".into(), "sap".into()]).validate().is_err());
        assert!(with_tags(vec!["two words".into()]).validate().is_err());
        assert!(with_tags(vec!["x".repeat(MAX_LABEL_LEN + 1)]).validate().is_err());
        assert!(with_tags((0..=MAX_TAGS).map(|i| format!("t{i}")).collect())
            .validate()
            .is_err());

        let caps = RobotCapabilities {
            supported_browsers: vec![String::new()],
            ..Default::default()
        };
        assert!(caps.validate().is_err());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let caps = RobotCapabilities {
            max_concurrent_jobs: 0,
            ..Default::default()
        };
        assert!(caps.validate().is_err());
        assert!(RobotCapabilities::default().validate().is_ok());
    }

    #[test]
    fn meminfo_parsing() {
        let sample = "MemTotal:       16303428 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_meminfo_total_mb(sample), Some(15921));
        assert_eq!(parse_meminfo_total_mb("MemFree: 1 kB"), None);
    }

    #[test]
    fn detect_fills_host_facts() {
        let caps = RobotCapabilities::detect();
        assert!(caps.cpu_cores >= 1);
        assert!(caps.os_info.contains(std::env::consts::OS));
    }

    #[test]
    fn robot_type_parsing_and_wire_format() {
        assert_eq!("Attended".parse::<RobotType>().unwrap(), RobotType::Attended);
        assert!("cyborg".parse::<RobotType>().is_err());
        let json = serde_json::to_value(RobotCapabilities::default()).unwrap();
        assert_eq!(json["robot_type"], "unattended");
        assert_eq!(json["supported_browsers"][0], "chromium");
    }

    #[test]
    fn list_parsing() {
        assert_eq!(parse_list(" a, b ,,c "), vec!["a", "b", "c"]);
        assert!(parse_list("").is_empty());
    }
}
