//! Driver message severities and filters

use bitflags::bitflags;
use log::Level;
use serde::{Deserialize, Serialize};

/// Severity of a message reported by the backend debug layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    /// Verbose driver chatter
    Message,
    /// Informational
    Info,
    /// Suspicious but valid usage
    Warning,
    /// Invalid usage; the call was dropped
    Error,
    /// Memory corruption detected
    Corruption,
}

impl Severity {
    /// Every severity, in ascending order
    pub const ALL: [Severity; 5] = [
        Severity::Message,
        Severity::Info,
        Severity::Warning,
        Severity::Error,
        Severity::Corruption,
    ];

    /// Log level a message of this severity is forwarded at
    pub fn log_level(self) -> Level {
        match self {
            Severity::Message => Level::Trace,
            Severity::Info => Level::Info,
            Severity::Warning => Level::Warn,
            Severity::Error | Severity::Corruption => Level::Error,
        }
    }

    /// Filter bit for this severity
    pub fn flag(self) -> SeverityFilter {
        match self {
            Severity::Message => SeverityFilter::MESSAGE,
            Severity::Info => SeverityFilter::INFO,
            Severity::Warning => SeverityFilter::WARNING,
            Severity::Error => SeverityFilter::ERROR,
            Severity::Corruption => SeverityFilter::CORRUPTION,
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

bitflags! {
    /// Set of severities the message pump drops instead of logging
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct SeverityFilter: u8 {
        /// Drop verbose driver chatter
        const MESSAGE = 1 << 0;
        /// Drop informational messages
        const INFO = 1 << 1;
        /// Drop warnings
        const WARNING = 1 << 2;
        /// Drop errors
        const ERROR = 1 << 3;
        /// Drop corruption reports
        const CORRUPTION = 1 << 4;
    }
}

impl SeverityFilter {
    /// Whether messages of `severity` are dropped
    pub fn denies(self, severity: Severity) -> bool {
        self.contains(severity.flag())
    }
}

/// A message stored in the backend debug queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    /// Message severity
    pub severity: Severity,
    /// Backend-specific message id
    pub id: u32,
    /// Human-readable text
    pub description: String,
}

impl DebugMessage {
    /// Create a message
    pub fn new(severity: Severity, id: u32, description: impl Into<String>) -> Self {
        Self {
            severity,
            id,
            description: description.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_log_levels() {
        assert_eq!(Severity::Message.log_level(), Level::Trace);
        assert_eq!(Severity::Info.log_level(), Level::Info);
        assert_eq!(Severity::Warning.log_level(), Level::Warn);
        assert_eq!(Severity::Error.log_level(), Level::Error);
        assert_eq!(Severity::Corruption.log_level(), Level::Error);
    }

    #[test]
    fn test_filter_denies_only_listed_severities() {
        let filter = SeverityFilter::MESSAGE | SeverityFilter::INFO;
        assert!(filter.denies(Severity::Message));
        assert!(filter.denies(Severity::Info));
        assert!(!filter.denies(Severity::Warning));
        assert!(!SeverityFilter::empty().denies(Severity::Corruption));
    }
}
