//! Member identity and the on-disk membership table.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::{fmt, fs, io};

use crate::core::MEMBERS;

#[allow(clippy::cast_possible_truncation)]
const LAST_MEMBER: u8 = MEMBERS as u8;

/// Identity of one panel member, `M1`..`M9` on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemberId(u8);

impl MemberId {
    /// Numeric suffix, `1..=9`; the tie-breaking tail of every proposal
    /// number this member mints.
    #[must_use]
    pub fn index(self) -> i64 {
        i64::from(self.0)
    }

    /// The full fixed roster, `M1` through `M9`.
    pub fn all() -> impl Iterator<Item = MemberId> {
        (1..=LAST_MEMBER).map(MemberId)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParseMemberIdError;

impl fmt::Display for ParseMemberIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("member ids are M1 through M9")
    }
}

impl std::error::Error for ParseMemberIdError {}

impl FromStr for MemberId {
    type Err = ParseMemberIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let suffix = s.strip_prefix('M').ok_or(ParseMemberIdError)?;
        let k: u8 = suffix.parse().map_err(|_| ParseMemberIdError)?;
        if (1..=LAST_MEMBER).contains(&k) {
            Ok(MemberId(k))
        } else {
            Err(ParseMemberIdError)
        }
    }
}

/// Where a member listens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

/// The fixed nine-member roster with one address per member. Loaded once at
/// startup, read-only afterwards.
#[derive(Clone, Debug, Default)]
pub struct Membership {
    members: BTreeMap<MemberId, PeerAddr>,
}

impl Membership {
    /// Load the roster from a `memberId,host,port`-per-line file. Blank lines
    /// and `#` comments are ignored.
    ///
    /// # Errors
    ///
    /// Fails on unreadable files, malformed lines, duplicate members, or a
    /// roster that does not cover all nine members.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::Io)?;
        Self::parse(&text)
    }

    /// Parse roster text; see [`Membership::load`].
    ///
    /// # Errors
    ///
    /// Fails on malformed lines, duplicate members, or an incomplete roster.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut members = BTreeMap::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let number = idx + 1;
            let mut fields = line.split(',').map(str::trim);
            let (Some(id), Some(host), Some(port), None) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                return Err(ConfigError::BadLine {
                    number,
                    reason: "expected memberId,host,port",
                });
            };
            let id: MemberId = id.parse().map_err(|_| ConfigError::BadLine {
                number,
                reason: "bad member id",
            })?;
            let port: u16 = port.parse().map_err(|_| ConfigError::BadLine {
                number,
                reason: "bad port",
            })?;
            let addr = PeerAddr {
                host: host.to_owned(),
                port,
            };
            if members.insert(id, addr).is_some() {
                return Err(ConfigError::DuplicateMember(id));
            }
        }
        if members.len() != MEMBERS {
            return Err(ConfigError::IncompleteRoster(members.len()));
        }
        Ok(Self { members })
    }

    #[must_use]
    pub fn addr(&self, id: MemberId) -> Option<&PeerAddr> {
        self.members.get(&id)
    }
}

impl FromIterator<(MemberId, PeerAddr)> for Membership {
    fn from_iter<I: IntoIterator<Item = (MemberId, PeerAddr)>>(iter: I) -> Self {
        Self {
            members: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    BadLine { number: usize, reason: &'static str },
    DuplicateMember(MemberId),
    IncompleteRoster(usize),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(error) => write!(f, "cannot read config: {error}"),
            ConfigError::BadLine { number, reason } => {
                write!(f, "config line {number}: {reason}")
            }
            ConfigError::DuplicateMember(id) => write!(f, "duplicate config entry for {id}"),
            ConfigError::IncompleteRoster(found) => {
                write!(f, "roster must list all {MEMBERS} members, found {found}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(error) => Some(error),
            _ => None,
        }
    }
}
