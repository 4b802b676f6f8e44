//! # Link Modes
//!
//! A radio transceiver tunes to one or more EN 13757-4 PHY profiles
//! (link modes). Receivers differ in which combinations they can listen
//! to simultaneously: an IM871A does C1+T1, a CUL only one of C1/T1 at a
//! time, an RC1180 only T1.

use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Set of link modes a device listens to or a configuration requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LinkModeSet: u16 {
        const C1  = 1 << 0;
        const T1  = 1 << 1;
        const S1  = 1 << 2;
        const S1M = 1 << 3;
        const N1A = 1 << 4;
        const N1B = 1 << 5;
        const N1C = 1 << 6;
        const N1D = 1 << 7;
        const N1E = 1 << 8;
        const N1F = 1 << 9;
        const ANY = 1 << 10;
    }
}

impl LinkModeSet {
    /// Does this set cover everything in `other`?
    pub fn covers(&self, other: LinkModeSet) -> bool {
        self.contains(LinkModeSet::ANY) || self.contains(other)
    }

    /// Parse a comma separated list like `"c1,t1"`.
    pub fn parse(s: &str) -> Option<LinkModeSet> {
        let mut set = LinkModeSet::empty();
        for tok in s.split(',') {
            let tok = tok.trim();
            if tok.is_empty() {
                continue;
            }
            set |= match tok.to_ascii_lowercase().as_str() {
                "c1" => LinkModeSet::C1,
                "t1" => LinkModeSet::T1,
                "s1" => LinkModeSet::S1,
                "s1m" => LinkModeSet::S1M,
                "n1a" => LinkModeSet::N1A,
                "n1b" => LinkModeSet::N1B,
                "n1c" => LinkModeSet::N1C,
                "n1d" => LinkModeSet::N1D,
                "n1e" => LinkModeSet::N1E,
                "n1f" => LinkModeSet::N1F,
                "any" => LinkModeSet::ANY,
                _ => return None,
            };
        }
        Some(set)
    }

    /// Human readable render, `"c1,t1"` style, `"none"` when empty.
    pub fn hr(&self) -> String {
        if self.is_empty() {
            return "none".to_string();
        }
        let names = [
            (LinkModeSet::ANY, "any"),
            (LinkModeSet::C1, "c1"),
            (LinkModeSet::T1, "t1"),
            (LinkModeSet::S1, "s1"),
            (LinkModeSet::S1M, "s1m"),
            (LinkModeSet::N1A, "n1a"),
            (LinkModeSet::N1B, "n1b"),
            (LinkModeSet::N1C, "n1c"),
            (LinkModeSet::N1D, "n1d"),
            (LinkModeSet::N1E, "n1e"),
            (LinkModeSet::N1F, "n1f"),
        ];
        names
            .iter()
            .filter(|(m, _)| self.contains(*m))
            .map(|(_, n)| *n)
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for LinkModeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hr())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_render() {
        let lms = LinkModeSet::parse("c1,t1").unwrap();
        assert!(lms.contains(LinkModeSet::C1));
        assert!(lms.contains(LinkModeSet::T1));
        assert_eq!(lms.hr(), "c1,t1");
    }

    #[test]
    fn test_parse_rejects_unknown_mode() {
        assert!(LinkModeSet::parse("c1,x9").is_none());
    }

    #[test]
    fn test_set_operations() {
        let a = LinkModeSet::C1 | LinkModeSet::T1;
        let b = LinkModeSet::T1;
        assert_eq!(a & b, LinkModeSet::T1);
        assert_eq!(a | b, a);
        assert!(a.covers(b));
        assert!(!b.covers(a));
    }

    #[test]
    fn test_any_covers_everything() {
        let any = LinkModeSet::ANY;
        assert!(any.covers(LinkModeSet::C1 | LinkModeSet::N1A));
    }

    #[test]
    fn test_empty_renders_none() {
        assert_eq!(LinkModeSet::empty().hr(), "none");
    }
}
