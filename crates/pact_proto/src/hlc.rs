//! Hybrid logical clock stamp.
//!
//! `(wall-clock millis, intra-millisecond counter, random tiebreaker)`,
//! rendered as `"<millis>:<counter>:<node-hex>"`. The short form
//! `"<millis>:<counter>"` parses with a zero tiebreaker.
//!
//! Ordering ([`Hlc::compare`]) looks at `(millis, counter)` only. The
//! tiebreaker exists so two replicas that stamp the same `(millis, counter)`
//! still resolve a conflict the same way ([`Hlc::supersedes`]).

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hlc {
    pub millis: u64,
    pub counter: u32,
    pub node: u32,
}

impl Hlc {
    pub const ZERO: Hlc = Hlc {
        millis: 0,
        counter: 0,
        node: 0,
    };

    pub fn new(millis: u64, counter: u32, node: u32) -> Self {
        Self { millis, counter, node }
    }

    /// Numeric order on `(millis, counter)`.
    pub fn compare(&self, other: &Hlc) -> Ordering {
        (self.millis, self.counter).cmp(&(other.millis, other.counter))
    }

    pub fn is_after(&self, other: &Hlc) -> bool {
        self.compare(other) == Ordering::Greater
    }

    /// Last-writer-wins decision: strictly later, or equal `(millis,
    /// counter)` with a larger tiebreaker.
    pub fn supersedes(&self, other: &Hlc) -> bool {
        match self.compare(other) {
            Ordering::Greater => true,
            Ordering::Equal => self.node > other.node,
            Ordering::Less => false,
        }
    }

    pub fn max(self, other: Hlc) -> Hlc {
        if other.supersedes(&self) {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{:08x}", self.millis, self.counter, self.node)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid HLC string: {0}")]
pub struct ParseHlcError(String);

impl FromStr for Hlc {
    type Err = ParseHlcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ParseHlcError(s.to_string());
        let mut parts = s.split(':');
        let millis: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let counter: u32 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
        let node = match parts.next() {
            Some(n) => u32::from_str_radix(n, 16).map_err(|_| bad())?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(Hlc { millis, counter, node })
    }
}

impl Serialize for Hlc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hlc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_and_long_forms() {
        let short: Hlc = "1700000000000:0".parse().unwrap();
        assert_eq!(short, Hlc::new(1_700_000_000_000, 0, 0));

        let long: Hlc = "5:3:0000beef".parse().unwrap();
        assert_eq!(long, Hlc::new(5, 3, 0xbeef));
        assert_eq!(long.to_string().parse::<Hlc>().unwrap(), long);

        assert!("5".parse::<Hlc>().is_err());
        assert!("a:b".parse::<Hlc>().is_err());
        assert!("1:2:3:4".parse::<Hlc>().is_err());
    }

    #[test]
    fn compare_ignores_tiebreaker() {
        let a = Hlc::new(10, 1, 1);
        let b = Hlc::new(10, 1, 2);
        assert_eq!(a.compare(&b), Ordering::Equal);
        assert!(b.supersedes(&a));
        assert!(!a.supersedes(&b));
        assert!(!a.supersedes(&a));
        assert!(Hlc::new(10, 2, 0).is_after(&b));
        assert!(Hlc::new(11, 0, 0).is_after(&Hlc::new(10, 9, 0)));
    }

    #[test]
    fn serialises_as_string() {
        let h = Hlc::new(42, 7, 0xff);
        assert_eq!(serde_json::to_string(&h).unwrap(), "\"42:7:000000ff\"");
    }
}
