//! ICE candidate classification, read from the `typ` token of the candidate line.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown,
}

impl CandidateKind {
    pub fn classify(candidate: &str) -> Self {
        let mut tokens = candidate.split_whitespace();
        while let Some(tok) = tokens.next() {
            if tok == "typ" {
                return match tokens.next() {
                    Some("host") => CandidateKind::Host,
                    Some("srflx") => CandidateKind::ServerReflexive,
                    Some("prflx") => CandidateKind::PeerReflexive,
                    Some("relay") => CandidateKind::Relay,
                    _ => CandidateKind::Unknown,
                };
            }
        }
        CandidateKind::Unknown
    }

    /// A relayed (TURN) path works but is slower than a direct one.
    pub fn is_degraded(&self) -> bool {
        matches!(self, CandidateKind::Relay)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateKind::Host => "host",
            CandidateKind::ServerReflexive => "srflx",
            CandidateKind::PeerReflexive => "prflx",
            CandidateKind::Relay => "relay",
            CandidateKind::Unknown => "unknown",
        }
    }
}
