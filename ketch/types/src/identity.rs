use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Author/committer identity stamped into commit objects.
///
/// `when_ms` is milliseconds since the Unix epoch as proposed by the leader's
/// monotonic clock. Timezone handling is out of scope for the replication
/// core; identities always serialize with a `+0000` offset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonIdent {
    pub name: String,
    pub email: String,
    pub when_ms: u64,
}

impl PersonIdent {
    pub fn new(name: impl Into<String>, email: impl Into<String>, when_ms: u64) -> Self {
        PersonIdent {
            name: name.into(),
            email: email.into(),
            when_ms,
        }
    }

    /// Whether two idents name the same person, ignoring the timestamp.
    pub fn same_person(&self, other: &PersonIdent) -> bool {
        self.name == other.name && self.email == other.email
    }

    pub(crate) fn encode(&self) -> String {
        format!("{} <{}> {} +0000", self.name, self.email, self.when_ms / 1000)
    }

    pub(crate) fn decode(line: &str) -> Result<Self, ParseError> {
        let malformed = || ParseError::MalformedIdentity(line.to_string());
        let lt = line.find('<').ok_or_else(malformed)?;
        let gt = line[lt..].find('>').map(|i| lt + i).ok_or_else(malformed)?;
        let name = line[..lt].trim_end().to_string();
        let email = line[lt + 1..gt].to_string();
        let rest = line[gt + 1..].trim_start();
        let secs: u64 = rest
            .split_whitespace()
            .next()
            .ok_or_else(malformed)?
            .parse()
            .map_err(|_| malformed())?;
        Ok(PersonIdent {
            name,
            email,
            when_ms: secs * 1000,
        })
    }
}

impl fmt::Display for PersonIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}
