use crate::identity::PersonIdent;
use crate::object_id::ObjectId;
use crate::ParseError;

/// Footer key carrying the leader term in election and proposal commits.
pub const TERM_FOOTER: &str = "Term: ";

/// Metadata of a commit object in the replicated log.
///
/// The encoding is line oriented: a `tree` line, zero or more `parent` lines,
/// `author` and `committer` lines, a blank separator and the free-form
/// message. The object id is the content hash of the encoded form, so two
/// commits with identical metadata collapse to the same id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommitData {
    pub tree: ObjectId,
    pub parents: Vec<ObjectId>,
    pub author: PersonIdent,
    pub committer: PersonIdent,
    pub message: String,
}

impl CommitData {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::new();
        out.push_str("tree ");
        out.push_str(&self.tree.to_hex());
        out.push('\n');
        for parent in &self.parents {
            out.push_str("parent ");
            out.push_str(&parent.to_hex());
            out.push('\n');
        }
        out.push_str("author ");
        out.push_str(&self.author.encode());
        out.push('\n');
        out.push_str("committer ");
        out.push_str(&self.committer.encode());
        out.push('\n');
        out.push('\n');
        out.push_str(&self.message);
        out.into_bytes()
    }

    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        let text = std::str::from_utf8(data)
            .map_err(|_| ParseError::MalformedCommit("not utf-8".to_string()))?;
        let (header, message) = text
            .split_once("\n\n")
            .ok_or_else(|| ParseError::MalformedCommit("missing header separator".to_string()))?;

        let mut tree = None;
        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        for line in header.lines() {
            if let Some(rest) = line.strip_prefix("tree ") {
                tree = Some(ObjectId::from_hex(rest)?);
            } else if let Some(rest) = line.strip_prefix("parent ") {
                parents.push(ObjectId::from_hex(rest)?);
            } else if let Some(rest) = line.strip_prefix("author ") {
                author = Some(PersonIdent::decode(rest)?);
            } else if let Some(rest) = line.strip_prefix("committer ") {
                committer = Some(PersonIdent::decode(rest)?);
            } else {
                return Err(ParseError::MalformedCommit(format!(
                    "unknown header line: {line}"
                )));
            }
        }
        Ok(CommitData {
            tree: tree.ok_or_else(|| ParseError::MalformedCommit("missing tree".to_string()))?,
            parents,
            author: author
                .ok_or_else(|| ParseError::MalformedCommit("missing author".to_string()))?,
            committer: committer
                .ok_or_else(|| ParseError::MalformedCommit("missing committer".to_string()))?,
            message: message.to_string(),
        })
    }

    /// The content-addressed id of this commit.
    pub fn id(&self) -> ObjectId {
        ObjectId::hash_content("commit", &self.encode())
    }

    /// First parent, if any.
    pub fn parent(&self) -> Option<ObjectId> {
        self.parents.first().copied()
    }

    /// Term recorded in this commit's message footer.
    pub fn term(&self) -> Result<u64, ParseError> {
        parse_term(&self.message).ok_or(ParseError::MissingTerm)
    }
}

/// Read the term from a commit message.
///
/// The term is the first whitespace-separated token after the last `Term:`
/// footer line; everything after it (the election disambiguation tag) is
/// ignored.
pub fn parse_term(message: &str) -> Option<u64> {
    message
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(TERM_FOOTER))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|token| token.parse().ok())
}
