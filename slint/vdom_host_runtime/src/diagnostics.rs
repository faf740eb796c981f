use crate::protocol::VDomMessage;
use std::collections::VecDeque;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn from_message_type(message_type: &str) -> Self {
        match message_type {
            "error" => Severity::Error,
            "warn" | "warning" => Severity::Warn,
            "debug" => Severity::Debug,
            _ => Severity::Info,
        }
    }

    pub fn as_message_type(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub origin: Origin,
    pub message: String,
    pub stack_trace: Option<String>,
}

impl Diagnostic {
    pub fn to_message(&self) -> VDomMessage {
        VDomMessage {
            message_type: self.severity.as_message_type().to_string(),
            message: self.message.clone(),
            stack_trace: self.stack_trace.clone(),
            params: Vec::new(),
        }
    }
}

/// Developer-facing log. Bounded; the oldest entries fall off first.
/// Local entries are also held until the next outgoing request forwards them.
#[derive(Debug)]
pub struct DiagnosticLog {
    entries: VecDeque<Diagnostic>,
    capacity: usize,
    unforwarded: VecDeque<Diagnostic>,
    total: u64,
}

impl DiagnosticLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            unforwarded: VecDeque::new(),
            total: 0,
        }
    }

    pub fn local(&mut self, severity: Severity, message: impl Into<String>) {
        self.push(Diagnostic {
            severity,
            origin: Origin::Local,
            message: message.into(),
            stack_trace: None,
        });
    }

    pub fn remote(&mut self, message: &VDomMessage) {
        self.push(Diagnostic {
            severity: Severity::from_message_type(&message.message_type),
            origin: Origin::Remote,
            message: message.message.clone(),
            stack_trace: message.stack_trace.clone().filter(|trace| !trace.is_empty()),
        });
    }

    fn push(&mut self, diagnostic: Diagnostic) {
        let origin = match diagnostic.origin {
            Origin::Local => "local",
            Origin::Remote => "remote",
        };
        let message = diagnostic.message.as_str();
        match diagnostic.severity {
            Severity::Debug => debug!(origin, "{message}"),
            Severity::Info => info!(origin, "{message}"),
            Severity::Warn => warn!(origin, "{message}"),
            Severity::Error => match &diagnostic.stack_trace {
                Some(stack) => error!(origin, stack = %stack, "{message}"),
                None => error!(origin, "{message}"),
            },
        }

        if diagnostic.origin == Origin::Local {
            if self.unforwarded.len() == self.capacity {
                self.unforwarded.pop_front();
            }
            self.unforwarded.push_back(diagnostic.clone());
        }

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(diagnostic);
        self.total += 1;
    }

    pub fn entries(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Count of every diagnostic ever recorded, including evicted ones.
    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn take_unforwarded(&mut self) -> Vec<VDomMessage> {
        self.unforwarded
            .drain(..)
            .map(|diagnostic| diagnostic.to_message())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_is_bounded_but_counts_everything() {
        let mut log = DiagnosticLog::new(2);
        log.local(Severity::Warn, "one");
        log.local(Severity::Warn, "two");
        log.local(Severity::Warn, "three");

        assert_eq!(log.len(), 2);
        assert_eq!(log.total(), 3);
        let kept: Vec<_> = log.entries().map(|d| d.message.as_str()).collect();
        assert_eq!(kept, vec!["two", "three"]);
    }

    #[test]
    fn unforwarded_backlog_keeps_only_the_newest() {
        let mut log = DiagnosticLog::new(2);
        for message in ["one", "two", "three"] {
            log.local(Severity::Warn, message);
        }

        let forwarded: Vec<_> = log
            .take_unforwarded()
            .into_iter()
            .map(|message| message.message)
            .collect();
        assert_eq!(forwarded, vec!["two", "three"]);
    }

    #[test]
    fn only_local_entries_are_forwarded() {
        let mut log = DiagnosticLog::new(8);
        log.local(Severity::Error, "bad patch");
        log.remote(&VDomMessage {
            message_type: "warn".to_string(),
            message: "from backend".to_string(),
            stack_trace: Some(String::new()),
            params: Vec::new(),
        });

        let forwarded = log.take_unforwarded();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].message_type, "error");
        assert_eq!(forwarded[0].message, "bad patch");
        assert!(log.take_unforwarded().is_empty());

        let remote = log.entries().last().expect("remote entry");
        assert_eq!(remote.origin, Origin::Remote);
        assert_eq!(remote.severity, Severity::Warn);
        assert_eq!(remote.stack_trace, None);
    }
}
