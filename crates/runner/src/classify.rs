#![forbid(unsafe_code)]

use regex::RegexSet;
use std::sync::LazyLock;

/// Failures worth retrying in another region: GCE stockouts and nodes that never registered.
const TRANSIENT_PATTERNS: &[&str] = &[
    r".*does not have enough resources available to fulfill.*",
    r".*only \d+ nodes out of \d+ have registered; this is likely due to Nodes failing to start correctly.*",
];

static TRANSIENT: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new(TRANSIENT_PATTERNS).expect("transient failure patterns should be valid")
});

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Fatal,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Fatal => "fatal",
        }
    }
}

pub fn classify_failure(output: &str) -> FailureClass {
    if TRANSIENT.is_match(output) {
        FailureClass::Transient
    } else {
        FailureClass::Fatal
    }
}
