//! Agent line-protocol prober (spec.md §4.3 "Agent", §6 "Agent wire protocol").

use crate::check::CheckStatus;
use crate::probers::first_line;

/// The outcome of feeding the agent prober a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutcome {
    /// No full line yet.
    Pending,
    /// A weight-change request, as a percentage of the configured weight.
    WeightPercent(u32),
    /// An explicit forced status (only `down`/`stopped`/`fail` produce this).
    Forced { status: CheckStatus, desc: String },
    /// The line didn't match any recognised token.
    Unrecognised { desc: String },
}

/// Feed the agent prober the current ingress buffer. `agent_enabled` governs
/// whether a bare percentage is honoured (spec.md: "unless agent is disabled").
pub fn probe(bi: &[u8], done: bool, agent_enabled: bool) -> AgentOutcome {
    let Some((line, _)) = first_line(bi) else {
        return if done {
            AgentOutcome::Unrecognised {
                desc: "Unknown feedback string".to_string(),
            }
        } else {
            AgentOutcome::Pending
        };
    };

    let line = std::str::from_utf8(line).unwrap_or("").trim();

    if line.contains('%') && agent_enabled {
        if let Some(pct) = line.strip_suffix('%').and_then(|n| n.trim().parse::<u32>().ok()) {
            return AgentOutcome::WeightPercent(pct);
        }
    }

    if line.eq_ignore_ascii_case("drain") {
        return AgentOutcome::WeightPercent(0);
    }

    for prefix in ["down", "stopped", "fail"] {
        if let Some(rest) = line.get(..prefix.len().min(line.len())) {
            if rest.eq_ignore_ascii_case(prefix) {
                let tail = &line[prefix.len()..];
                if tail.is_empty() || tail.starts_with(' ') || tail.starts_with('\t') {
                    return AgentOutcome::Forced {
                        status: CheckStatus::L7Sts,
                        desc: line.to_string(),
                    };
                }
            }
        }
    }

    AgentOutcome::Unrecognised {
        desc: "Unknown feedback string".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_weight_change() {
        assert_eq!(probe(b"50%\n", true, true), AgentOutcome::WeightPercent(50));
    }

    #[test]
    fn percentage_ignored_when_agent_disabled() {
        assert_eq!(
            probe(b"50%\n", true, false),
            AgentOutcome::Unrecognised {
                desc: "Unknown feedback string".to_string()
            }
        );
    }

    #[test]
    fn drain_is_zero_percent() {
        assert_eq!(probe(b"DRAIN\n", true, true), AgentOutcome::WeightPercent(0));
    }

    #[test]
    fn down_forces_failure() {
        assert_eq!(
            probe(b"down\n", true, true),
            AgentOutcome::Forced {
                status: CheckStatus::L7Sts,
                desc: "down".to_string()
            }
        );
    }

    #[test]
    fn down_prefix_without_boundary_is_unrecognised() {
        assert_eq!(
            probe(b"downtown\n", true, true),
            AgentOutcome::Unrecognised {
                desc: "Unknown feedback string".to_string()
            }
        );
    }

    #[test]
    fn idempotent_weight_change_applied_twice() {
        let first = probe(b"50%\n", true, true);
        let second = probe(b"50%\n", true, true);
        assert_eq!(first, second);
    }
}
