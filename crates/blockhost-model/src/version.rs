use std::{fmt, str::FromStr};

/// Separator between the rendered version and its type in cache file names.
pub const CACHE_KEY_SEPARATOR: &str = "---";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionType {
    Release,
    Snapshot,
    Alpha,
    Beta,
    Classic,
    Indev,
    Infdev,
    Custom,
}

impl VersionType {
    pub const ALL: [VersionType; 8] = [
        VersionType::Release,
        VersionType::Snapshot,
        VersionType::Alpha,
        VersionType::Beta,
        VersionType::Classic,
        VersionType::Indev,
        VersionType::Infdev,
        VersionType::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            VersionType::Release => "release",
            VersionType::Snapshot => "snapshot",
            VersionType::Alpha => "alpha",
            VersionType::Beta => "beta",
            VersionType::Classic => "classic",
            VersionType::Indev => "indev",
            VersionType::Infdev => "infdev",
            VersionType::Custom => "custom",
        }
    }
}

impl fmt::Display for VersionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionType {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        VersionType::ALL
            .into_iter()
            .find(|t| t.as_str() == lower)
            .ok_or_else(|| VersionParseError::UnknownType(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionParseError {
    #[error("unknown version type: {0}")]
    UnknownType(String),
    #[error("invalid {ty} version: {input:?}")]
    Invalid { input: String, ty: VersionType },
    #[error("invalid cache key: {0:?}")]
    CacheKey(String),
}

/// Dotted version used by the pre-release phases (`a1.2.6`, `b1.6_01`, `c0.30`).
///
/// `revision` is the underscore-suffixed hotfix number and is always rendered
/// with two digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct PhaseNumber {
    pub major: u16,
    pub minor: u16,
    pub patch: Option<u16>,
    pub revision: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct BuildDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerVersion {
    Release { phase: u16, major: u16, minor: u16 },
    /// `year` is the two-digit year, `letter` a lowercase ASCII letter.
    Snapshot { year: u8, week: u8, letter: char },
    Alpha(PhaseNumber),
    Beta(PhaseNumber),
    Classic(PhaseNumber),
    Indev(BuildDate),
    Infdev(BuildDate),
    Custom { name: String },
}

impl ServerVersion {
    pub fn release(phase: u16, major: u16, minor: u16) -> Self {
        ServerVersion::Release {
            phase,
            major,
            minor,
        }
    }

    pub fn version_type(&self) -> VersionType {
        match self {
            ServerVersion::Release { .. } => VersionType::Release,
            ServerVersion::Snapshot { .. } => VersionType::Snapshot,
            ServerVersion::Alpha(_) => VersionType::Alpha,
            ServerVersion::Beta(_) => VersionType::Beta,
            ServerVersion::Classic(_) => VersionType::Classic,
            ServerVersion::Indev(_) => VersionType::Indev,
            ServerVersion::Infdev(_) => VersionType::Infdev,
            ServerVersion::Custom { .. } => VersionType::Custom,
        }
    }

    /// Canonical string form; `parse(render(v), v.version_type()) == v`.
    pub fn render(&self) -> String {
        match self {
            ServerVersion::Release {
                phase,
                major,
                minor,
            } => {
                if *minor == 0 {
                    format!("{phase}.{major}")
                } else {
                    format!("{phase}.{major}.{minor}")
                }
            }
            ServerVersion::Snapshot { year, week, letter } => {
                format!("{year:02}w{week:02}{letter}")
            }
            ServerVersion::Alpha(n) => render_phase('a', n),
            ServerVersion::Beta(n) => render_phase('b', n),
            ServerVersion::Classic(n) => render_phase('c', n),
            ServerVersion::Indev(d) => render_date("in-", d),
            ServerVersion::Infdev(d) => render_date("inf-", d),
            ServerVersion::Custom { name } => name.clone(),
        }
    }

    pub fn parse(input: &str, ty: VersionType) -> Result<Self, VersionParseError> {
        let invalid = || VersionParseError::Invalid {
            input: input.to_string(),
            ty,
        };
        let s = input.trim();

        match ty {
            VersionType::Release => {
                let parts = parse_dotted(s).ok_or_else(invalid)?;
                match parts.as_slice() {
                    [phase, major] => Ok(ServerVersion::release(*phase, *major, 0)),
                    [phase, major, minor] => Ok(ServerVersion::release(*phase, *major, *minor)),
                    _ => Err(invalid()),
                }
            }
            VersionType::Snapshot => parse_snapshot(s).ok_or_else(invalid),
            VersionType::Alpha => parse_phase(s, 'a')
                .map(ServerVersion::Alpha)
                .ok_or_else(invalid),
            VersionType::Beta => parse_phase(s, 'b')
                .map(ServerVersion::Beta)
                .ok_or_else(invalid),
            VersionType::Classic => parse_phase(s, 'c')
                .map(ServerVersion::Classic)
                .ok_or_else(invalid),
            VersionType::Indev => parse_date(s, "in-")
                .map(ServerVersion::Indev)
                .ok_or_else(invalid),
            VersionType::Infdev => parse_date(s, "inf-")
                .map(ServerVersion::Infdev)
                .ok_or_else(invalid),
            VersionType::Custom => {
                if s.is_empty() || s.contains(['/', '\\']) || s.contains(CACHE_KEY_SEPARATOR) {
                    return Err(invalid());
                }
                Ok(ServerVersion::Custom {
                    name: s.to_string(),
                })
            }
        }
    }

    /// Best-effort type detection for callers that only have the version string.
    /// Anything unrecognised becomes `Custom`, under the same rules as
    /// `parse(input, VersionType::Custom)`.
    pub fn infer(input: &str) -> Result<Self, VersionParseError> {
        const ORDER: [VersionType; 7] = [
            VersionType::Release,
            VersionType::Snapshot,
            VersionType::Infdev,
            VersionType::Indev,
            VersionType::Alpha,
            VersionType::Beta,
            VersionType::Classic,
        ];
        ORDER
            .into_iter()
            .find_map(|ty| ServerVersion::parse(input, ty).ok())
            .map_or_else(|| ServerVersion::parse(input, VersionType::Custom), Ok)
    }

    /// `<versionString>---<versionType>`, used as the cached jar's file stem and
    /// as the jar reference key.
    pub fn cache_key(&self) -> String {
        format!(
            "{}{CACHE_KEY_SEPARATOR}{}",
            self.render(),
            self.version_type()
        )
    }

    pub fn from_cache_key(key: &str) -> Result<Self, VersionParseError> {
        let (version, ty) = key
            .rsplit_once(CACHE_KEY_SEPARATOR)
            .ok_or_else(|| VersionParseError::CacheKey(key.to_string()))?;
        let ty: VersionType = ty.parse()?;
        ServerVersion::parse(version, ty)
    }
}

impl fmt::Display for ServerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

fn render_phase(prefix: char, n: &PhaseNumber) -> String {
    let mut out = format!("{prefix}{}.{}", n.major, n.minor);
    if let Some(patch) = n.patch {
        out.push_str(&format!(".{patch}"));
    }
    if let Some(rev) = n.revision {
        out.push_str(&format!("_{rev:02}"));
    }
    out
}

fn render_date(prefix: &str, d: &BuildDate) -> String {
    format!("{prefix}{:04}{:02}{:02}", d.year, d.month, d.day)
}

fn parse_u16(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_dotted(s: &str) -> Option<Vec<u16>> {
    s.split('.').map(parse_u16).collect()
}

fn parse_snapshot(s: &str) -> Option<ServerVersion> {
    let (year, rest) = s.split_once('w')?;
    if year.len() != 2 || rest.len() != 3 || !rest.is_ascii() {
        return None;
    }
    let year: u8 = parse_u16(year)?.try_into().ok()?;
    let letter = rest.chars().last()?;
    if !letter.is_ascii_lowercase() {
        return None;
    }
    let week: u8 = parse_u16(&rest[..2])?.try_into().ok()?;
    Some(ServerVersion::Snapshot { year, week, letter })
}

fn parse_phase(s: &str, prefix: char) -> Option<PhaseNumber> {
    let body = s.strip_prefix(prefix)?;
    let (dotted, revision) = match body.split_once('_') {
        Some((dotted, rev)) => {
            if rev.len() != 2 {
                return None;
            }
            let rev: u8 = parse_u16(rev)?.try_into().ok()?;
            (dotted, Some(rev))
        }
        None => (body, None),
    };
    let parts = parse_dotted(dotted)?;
    match parts.as_slice() {
        [major, minor] => Some(PhaseNumber {
            major: *major,
            minor: *minor,
            patch: None,
            revision,
        }),
        [major, minor, patch] => Some(PhaseNumber {
            major: *major,
            minor: *minor,
            patch: Some(*patch),
            revision,
        }),
        _ => None,
    }
}

fn parse_date(s: &str, prefix: &str) -> Option<BuildDate> {
    let digits = s.strip_prefix(prefix)?;
    if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year = digits[..4].parse().ok()?;
    let month: u8 = digits[4..6].parse().ok()?;
    let day: u8 = digits[6..].parse().ok()?;
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    Some(BuildDate { year, month, day })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<ServerVersion> {
        vec![
            ServerVersion::release(1, 20, 0),
            ServerVersion::release(1, 20, 4),
            ServerVersion::release(1, 8, 9),
            ServerVersion::Snapshot {
                year: 23,
                week: 5,
                letter: 'a',
            },
            ServerVersion::Snapshot {
                year: 9,
                week: 45,
                letter: 'c',
            },
            ServerVersion::Alpha(PhaseNumber {
                major: 1,
                minor: 2,
                patch: Some(6),
                revision: None,
            }),
            ServerVersion::Alpha(PhaseNumber {
                major: 1,
                minor: 0,
                patch: Some(16),
                revision: Some(2),
            }),
            ServerVersion::Beta(PhaseNumber {
                major: 1,
                minor: 7,
                patch: Some(3),
                revision: None,
            }),
            ServerVersion::Beta(PhaseNumber {
                major: 1,
                minor: 6,
                patch: None,
                revision: Some(1),
            }),
            ServerVersion::Beta(PhaseNumber {
                major: 1,
                minor: 0,
                patch: None,
                revision: None,
            }),
            ServerVersion::Classic(PhaseNumber {
                major: 0,
                minor: 30,
                patch: None,
                revision: Some(1),
            }),
            ServerVersion::Indev(BuildDate {
                year: 2010,
                month: 2,
                day: 23,
            }),
            ServerVersion::Infdev(BuildDate {
                year: 2010,
                month: 6,
                day: 30,
            }),
            ServerVersion::Custom {
                name: "paper-1.20.4-435".to_string(),
            },
        ]
    }

    #[test]
    fn render_then_parse_is_identity() {
        for v in samples() {
            let rendered = v.render();
            let parsed = ServerVersion::parse(&rendered, v.version_type())
                .unwrap_or_else(|e| panic!("{rendered}: {e}"));
            assert_eq!(parsed, v, "round trip of {rendered}");
        }

        for input in ["1.20.4", "23w45a", "a1.0.16_02", "in-20100223", "paper-1.20.4-435", " forge-47 "] {
            let v = ServerVersion::infer(input).unwrap();
            let parsed = ServerVersion::parse(&v.render(), v.version_type()).unwrap();
            assert_eq!(parsed, v, "round trip of inferred {input:?}");
        }
    }

    #[test]
    fn release_minor_zero_renders_two_components() {
        assert_eq!(ServerVersion::release(1, 20, 0).render(), "1.20");
        assert_eq!(
            ServerVersion::parse("1.20.0", VersionType::Release).unwrap(),
            ServerVersion::release(1, 20, 0)
        );
    }

    #[test]
    fn beta_revision_is_underscore_prefixed() {
        let v = ServerVersion::parse("b1.6_01", VersionType::Beta).unwrap();
        assert_eq!(v.render(), "b1.6_01");
        assert!(ServerVersion::parse("b1.6_1", VersionType::Beta).is_err());
    }

    #[test]
    fn parse_rejects_wrong_type() {
        assert!(ServerVersion::parse("23w45a", VersionType::Release).is_err());
        assert!(ServerVersion::parse("1.20.4", VersionType::Snapshot).is_err());
        assert!(ServerVersion::parse("in-20101399", VersionType::Indev).is_err());
        assert!(ServerVersion::parse("../evil", VersionType::Custom).is_err());
    }

    #[test]
    fn infer_detects_types() {
        let ty = |s: &str| ServerVersion::infer(s).unwrap().version_type();
        assert_eq!(ty("1.20.4"), VersionType::Release);
        assert_eq!(ty("23w45a"), VersionType::Snapshot);
        assert_eq!(ty("inf-20100630"), VersionType::Infdev);
        assert_eq!(ty("in-20100223"), VersionType::Indev);
        assert_eq!(ty("b1.7.3"), VersionType::Beta);
        assert_eq!(ty("forge-47"), VersionType::Custom);
    }

    #[test]
    fn infer_rejects_what_custom_parse_rejects() {
        for bad in ["", "   ", "../evil", "a\\b", "x---release"] {
            assert!(ServerVersion::infer(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn cache_key_round_trips() {
        for v in samples() {
            let key = v.cache_key();
            assert_eq!(ServerVersion::from_cache_key(&key).unwrap(), v, "{key}");
        }
        assert_eq!(ServerVersion::release(1, 20, 4).cache_key(), "1.20.4---release");
    }

    #[test]
    fn version_type_parses_case_insensitively() {
        assert_eq!("Release".parse::<VersionType>().unwrap(), VersionType::Release);
        assert!("nightly".parse::<VersionType>().is_err());
    }
}
