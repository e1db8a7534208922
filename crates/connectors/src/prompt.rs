//! Prompt extraction from free-text tool output
//!
//! `PromptExtractor::extract` is a pure function over the session's whole log
//! buffer. It is re-run every time output arrives rather than updated
//! incrementally; the buffer is bounded so the cost is bounded too.
//!
//! The marker strings are tied to the external tool's current wording and are
//! loaded as configuration (`PromptMarkers`), never hard-wired into the
//! orchestrators.

use std::collections::BTreeSet;

use armdock_protocol::{JointRange, RobotRole};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::ConnectorError;

/// Marker text and patterns recognised in tool output.
///
/// Substring markers are matched case-insensitively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptMarkers {
    /// Lines asking whether to overwrite an existing calibration file
    pub override_prompt: Vec<String>,
    /// Line announcing joints whose min and max never moved apart
    pub stuck_joints: String,
    /// How many lines after `stuck_joints` may hold the bracketed name list
    pub stuck_lookahead: usize,
    /// Per-joint telemetry row; captures name, min, pos, max
    pub range_row: String,
    /// A line that only appears once the control loop is running
    pub started_line: String,
    pub leader_connected: Vec<String>,
    pub follower_connected: Vec<String>,
    /// Error text that indicates a lost serial connection
    pub disconnect_errors: Vec<String>,
    /// Words that tie a nearby disconnect error to the leader arm
    pub leader_hints: Vec<String>,
    /// Words that tie a nearby disconnect error to the follower arm
    pub follower_hints: Vec<String>,
    /// Lines before a disconnect error searched for role hints
    pub disconnect_context: usize,
}

impl Default for PromptMarkers {
    fn default() -> Self {
        Self {
            override_prompt: vec![
                "press enter to use provided calibration file".to_string(),
                "type 'c' and press enter to run calibration".to_string(),
            ],
            stuck_joints: "same min and max values".to_string(),
            stuck_lookahead: 6,
            range_row: r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*\|\s*(-?\d+(?:\.\d+)?)\s*\|\s*(-?\d+(?:\.\d+)?)\s*\|\s*(-?\d+(?:\.\d+)?)\s*$".to_string(),
            started_line: r"^\s*time:\s*\d+(?:\.\d+)?\s*ms\b".to_string(),
            leader_connected: vec!["leader connected".to_string()],
            follower_connected: vec!["follower connected".to_string()],
            disconnect_errors: vec![
                "there is no status packet".to_string(),
                "incorrect status packet".to_string(),
                "failed to write".to_string(),
                "failed to read".to_string(),
                "port is in use".to_string(),
                "could not open port".to_string(),
                "returned no data".to_string(),
                "input/output error".to_string(),
                "no such file or directory".to_string(),
            ],
            leader_hints: vec!["leader".to_string()],
            follower_hints: vec!["follower".to_string()],
            disconnect_context: 8,
        }
    }
}

impl PromptMarkers {
    /// Load markers from a JSON file; missing keys keep their defaults.
    pub fn from_json_file(path: &std::path::Path) -> Result<Self, ConnectorError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            ConnectorError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })
    }
}

/// Extra per-session words tying an error to a role, e.g. each arm's device path.
#[derive(Debug, Clone, Default)]
pub struct RoleHints {
    pub leader: Vec<String>,
    pub follower: Vec<String>,
}

/// Disconnect evidence found in the log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisconnectSignals {
    pub roles: BTreeSet<RobotRole>,
    /// Error lines that named neither (or both) arms
    pub ambiguous: usize,
}

impl DisconnectSignals {
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty() && self.ambiguous == 0
    }
}

/// Structured signals derived from a log buffer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedSignals {
    pub override_prompt_line: Option<String>,
    pub stuck_joint_names: Vec<String>,
    /// One entry per joint in first-seen order, holding the last-seen triple
    pub range_rows: Vec<JointRange>,
    pub confirmed_started: bool,
}

/// Compiled form of `PromptMarkers`
#[derive(Debug, Clone)]
pub struct PromptExtractor {
    markers: PromptMarkers,
    override_prompt: Vec<String>,
    stuck_joints: String,
    range_row: Regex,
    started_line: Regex,
    leader_connected: Vec<String>,
    follower_connected: Vec<String>,
    disconnect_errors: Vec<String>,
}

impl Default for PromptExtractor {
    fn default() -> Self {
        // The built-in patterns are known to compile.
        match Self::new(PromptMarkers::default()) {
            Ok(extractor) => extractor,
            Err(e) => unreachable!("default prompt markers must compile: {e}"),
        }
    }
}

impl PromptExtractor {
    pub fn new(markers: PromptMarkers) -> Result<Self, ConnectorError> {
        Ok(Self {
            override_prompt: lowercase_all(&markers.override_prompt),
            stuck_joints: markers.stuck_joints.to_lowercase(),
            range_row: Regex::new(&markers.range_row)?,
            started_line: Regex::new(&markers.started_line)?,
            leader_connected: lowercase_all(&markers.leader_connected),
            follower_connected: lowercase_all(&markers.follower_connected),
            disconnect_errors: lowercase_all(&markers.disconnect_errors),
            markers,
        })
    }

    pub fn markers(&self) -> &PromptMarkers {
        &self.markers
    }

    /// Derive all signals from the full log buffer.
    pub fn extract<'a, I>(&self, lines: I) -> ExtractedSignals
    where
        I: IntoIterator<Item = &'a str>,
    {
        let lines: Vec<&str> = lines.into_iter().collect();
        let lowered: Vec<String> = lines.iter().map(|l| l.to_lowercase()).collect();

        let mut signals = ExtractedSignals::default();
        let mut leader_seen = false;
        let mut follower_seen = false;

        for (idx, line) in lines.iter().enumerate() {
            let lower = &lowered[idx];

            if contains_any(lower, &self.override_prompt) {
                signals.override_prompt_line = Some((*line).to_string());
            }

            if !self.stuck_joints.is_empty() && lower.contains(&self.stuck_joints) {
                let end = (idx + self.markers.stuck_lookahead).min(lines.len() - 1);
                if let Some(names) = lines[idx..=end].iter().find_map(|l| bracketed_names(l)) {
                    signals.stuck_joint_names = names;
                }
            }

            if let Some(row) = self.parse_range_row(line) {
                match signals.range_rows.iter_mut().find(|r| r.name == row.name) {
                    Some(existing) => *existing = row,
                    None => signals.range_rows.push(row),
                }
            }

            if self.started_line.is_match(line) {
                signals.confirmed_started = true;
            }
            leader_seen |= contains_any(lower, &self.leader_connected);
            follower_seen |= contains_any(lower, &self.follower_connected);
        }

        if leader_seen && follower_seen {
            signals.confirmed_started = true;
        }
        signals
    }

    /// Attribute disconnect error lines to a role using nearby hint words.
    ///
    /// A line is attributed only when the hints point at exactly one role;
    /// anything else is counted as ambiguous rather than guessed. Only lines
    /// at index `from` or later are examined; earlier ones serve as context.
    pub fn detect_disconnects<'a, I>(
        &self,
        lines: I,
        from: usize,
        hints: &RoleHints,
    ) -> DisconnectSignals
    where
        I: IntoIterator<Item = &'a str>,
    {
        let lowered: Vec<String> = lines.into_iter().map(str::to_lowercase).collect();
        let leader_hints = lowercase_all(
            self.markers
                .leader_hints
                .iter()
                .chain(hints.leader.iter())
                .cloned()
                .collect::<Vec<_>>()
                .as_slice(),
        );
        let follower_hints = lowercase_all(
            self.markers
                .follower_hints
                .iter()
                .chain(hints.follower.iter())
                .cloned()
                .collect::<Vec<_>>()
                .as_slice(),
        );

        let mut signals = DisconnectSignals::default();
        for (idx, line) in lowered.iter().enumerate().skip(from) {
            if !contains_any(line, &self.disconnect_errors) {
                continue;
            }
            let start = idx.saturating_sub(self.markers.disconnect_context);
            let window = &lowered[start..=idx];
            let leader = window.iter().any(|l| contains_any(l, &leader_hints));
            let follower = window.iter().any(|l| contains_any(l, &follower_hints));
            match (leader, follower) {
                (true, false) => {
                    signals.roles.insert(RobotRole::Leader);
                }
                (false, true) => {
                    signals.roles.insert(RobotRole::Follower);
                }
                _ => signals.ambiguous += 1,
            }
        }
        signals
    }

    fn parse_range_row(&self, line: &str) -> Option<JointRange> {
        let caps = self.range_row.captures(line)?;
        let number = |i: usize| caps.get(i)?.as_str().parse::<f64>().ok();
        Some(JointRange {
            name: caps.get(1)?.as_str().to_string(),
            min: number(2)?,
            pos: number(3)?,
            max: number(4)?,
        })
    }
}

fn lowercase_all(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|v| v.trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|n| haystack.contains(n.as_str()))
}

/// Parse `['a', "b", c]` into names. Returns None when no bracket pair exists.
fn bracketed_names(line: &str) -> Option<Vec<String>> {
    let open = line.find('[')?;
    let close = open + line[open..].find(']')?;
    Some(
        line[open + 1..close]
            .split(',')
            .map(|name| name.trim().trim_matches(|c| c == '\'' || c == '"').trim())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(lines: &[&str]) -> ExtractedSignals {
        PromptExtractor::default().extract(lines.iter().copied())
    }

    #[test]
    fn detects_override_prompt_case_insensitively() {
        let signals = extract(&[
            "Connecting...",
            "Press ENTER to use provided calibration file associated with the id arm, or type 'c' and press ENTER to run calibration: ",
        ]);
        assert!(signals
            .override_prompt_line
            .as_deref()
            .is_some_and(|l| l.starts_with("Press ENTER")));
    }

    #[test]
    fn range_rows_keep_last_value_per_joint() {
        let signals = extract(&[
            "NAME            |    MIN |    POS |    MAX",
            "base            |   2000 |   2047 |   2100",
            "unrelated chatter",
            "elbow           |   1000 |   1500 |   1600",
            "base            |   1500 |   1800 |   2900",
            "Recording positions. Press ENTER to stop...",
            "base            |   1400 |   1450 |   3000",
        ]);
        assert_eq!(signals.range_rows.len(), 2);
        assert_eq!(signals.range_rows[0].name, "base");
        assert_eq!(signals.range_rows[0].min, 1400.0);
        assert_eq!(signals.range_rows[0].pos, 1450.0);
        assert_eq!(signals.range_rows[0].max, 3000.0);
        assert_eq!(signals.range_rows[1].name, "elbow");
    }

    #[test]
    fn header_row_is_not_a_range() {
        let signals = extract(&["NAME | MIN | POS | MAX", "-------------------"]);
        assert!(signals.range_rows.is_empty());
    }

    #[test]
    fn stuck_joints_parsed_within_lookahead() {
        let signals = extract(&[
            "Traceback (most recent call last):",
            "ValueError: Some motors have the same min and max values:",
            "['shoulder_pan', \"wrist_roll\"]",
        ]);
        assert_eq!(signals.stuck_joint_names, vec!["shoulder_pan", "wrist_roll"]);
    }

    #[test]
    fn stuck_joints_outside_lookahead_are_ignored() {
        let mut lines = vec!["Some motors have the same min and max values:"];
        lines.extend(std::iter::repeat("noise").take(7));
        lines.push("['gripper']");
        let signals = extract(&lines);
        assert!(signals.stuck_joint_names.is_empty());
    }

    #[test]
    fn stuck_marker_without_bracket_yields_empty_list() {
        let signals = extract(&["Some motors have the same min and max values:"]);
        assert!(signals.stuck_joint_names.is_empty());
    }

    #[test]
    fn started_requires_both_connect_markers() {
        assert!(!extract(&["my_leader SO101Leader connected."]).confirmed_started);
        assert!(!extract(&["my_follower SO101Follower connected."]).confirmed_started);
        assert!(
            extract(&[
                "my_leader SO101Leader connected.",
                "my_follower SO101Follower connected.",
            ])
            .confirmed_started
        );
    }

    #[test]
    fn started_by_loop_timing_line_alone() {
        assert!(extract(&["time: 16.42ms (61 Hz)"]).confirmed_started);
    }

    #[test]
    fn disconnect_attributed_by_port_hint() {
        let extractor = PromptExtractor::default();
        let hints = RoleHints {
            leader: vec!["/dev/ttyacm0".to_string()],
            follower: vec!["/dev/ttyACM1".to_string()],
        };
        let signals = extractor.detect_disconnects(
            [
                "ConnectionError: Read failed due to communication error on port /dev/ttyACM1",
                "[TxRxResult] There is no status packet!",
            ],
            0,
            &hints,
        );
        assert_eq!(
            signals.roles.iter().copied().collect::<Vec<_>>(),
            vec![RobotRole::Follower]
        );
        assert_eq!(signals.ambiguous, 0);
    }

    #[test]
    fn disconnect_without_role_hint_is_ambiguous() {
        let extractor = PromptExtractor::default();
        let signals = extractor.detect_disconnects(
            ["[TxRxResult] There is no status packet!"],
            0,
            &RoleHints::default(),
        );
        assert!(signals.roles.is_empty());
        assert_eq!(signals.ambiguous, 1);
    }

    #[test]
    fn lines_before_from_are_context_only() {
        let extractor = PromptExtractor::default();
        let lines = [
            "leader arm on /dev/ttyACM0",
            "[TxRxResult] There is no status packet!",
            "[TxRxResult] There is no status packet!",
        ];
        let signals = extractor.detect_disconnects(lines, 2, &RoleHints::default());
        assert_eq!(
            signals.roles.iter().copied().collect::<Vec<_>>(),
            vec![RobotRole::Leader]
        );
        assert_eq!(signals.ambiguous, 0);
    }

    #[test]
    fn custom_markers_replace_defaults() {
        let markers = PromptMarkers {
            override_prompt: vec!["overwrite?".to_string()],
            ..PromptMarkers::default()
        };
        let extractor = PromptExtractor::new(markers).expect("compile");
        let signals = extractor.extract(["Overwrite? [y/N]"]);
        assert_eq!(signals.override_prompt_line.as_deref(), Some("Overwrite? [y/N]"));
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let markers = PromptMarkers {
            range_row: "(".to_string(),
            ..PromptMarkers::default()
        };
        assert!(matches!(
            PromptExtractor::new(markers),
            Err(ConnectorError::InvalidMarker(_))
        ));
    }
}
