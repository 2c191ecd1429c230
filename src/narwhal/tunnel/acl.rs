use std::collections::BTreeSet;

/// Which remote ports a user may bind.
///
/// Rule strings:
/// - `""` or `"0"`: any port
/// - `"80"`: exactly that port
/// - `"22,80,443"`: any listed port (non-numeric items are skipped)
/// - `"8000-8100"`: inclusive range
///
/// Anything else parses to [`PortRule::Deny`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortRule {
    Any,
    Single(u16),
    Set(BTreeSet<u16>),
    Range(u16, u16),
    Deny,
}

impl PortRule {
    pub fn parse(rule: &str) -> Self {
        let rule = rule.trim();
        if rule.is_empty() || rule == "0" {
            return PortRule::Any;
        }

        if rule.contains(',') {
            let ports = rule
                .split(',')
                .filter_map(|p| p.trim().parse::<u16>().ok())
                .collect();
            return PortRule::Set(ports);
        }

        if rule.contains('-') {
            let mut parts = rule.split('-');
            let (Some(lo), Some(hi), None) = (parts.next(), parts.next(), parts.next()) else {
                return PortRule::Deny;
            };
            return match (lo.trim().parse::<u16>(), hi.trim().parse::<u16>()) {
                (Ok(lo), Ok(hi)) => PortRule::Range(lo, hi),
                _ => PortRule::Deny,
            };
        }

        match rule.parse::<u16>() {
            Ok(n) => PortRule::Single(n),
            Err(_) => PortRule::Deny,
        }
    }

    pub fn allows(&self, port: u16) -> bool {
        match self {
            PortRule::Any => true,
            PortRule::Single(n) => port == *n,
            PortRule::Set(ports) => ports.contains(&port),
            PortRule::Range(lo, hi) => (*lo..=*hi).contains(&port),
            PortRule::Deny => false,
        }
    }
}

impl From<&str> for PortRule {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}
