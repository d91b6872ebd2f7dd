use serde::Deserialize;

/// Ordered substring → label lookup. Matching is case-insensitive and the
/// first entry whose pattern occurs in the input wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(from = "Vec<(String, String)>")]
pub struct PatternTable {
    entries: Vec<(String, String)>,
}

impl PatternTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, pattern: &str, label: &str) -> Self {
        self.insert(pattern, label);
        self
    }

    pub fn insert(&mut self, pattern: &str, label: &str) {
        self.entries.push((pattern.to_lowercase(), label.to_string()));
    }

    /// Carrier names recognised from router hostnames along a path.
    pub fn default_isps() -> Self {
        PatternTable::new()
            .with("comcast", "COMCAST")
            .with("xfinity", "COMCAST")
            .with("verizon", "VERIZON")
            .with("fios", "VERIZON")
            .with("att.net", "ATT")
            .with("attdns", "ATT")
            .with("cox.net", "COX")
            .with("charter", "CHARTER")
            .with("spectrum", "CHARTER")
            .with("centurylink", "CENTURYLINK")
            .with("qwest", "CENTURYLINK")
    }

    pub fn lookup(&self, text: &str) -> Option<&str> {
        let lower = text.to_lowercase();
        self.entries
            .iter()
            .find(|(p, _)| lower.contains(p.as_str()))
            .map(|(_, l)| l.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl From<Vec<(String, String)>> for PatternTable {
    fn from(pairs: Vec<(String, String)>) -> Self {
        pairs.into_iter().collect()
    }
}

impl<P: Into<String>, L: Into<String>> FromIterator<(P, L)> for PatternTable {
    fn from_iter<I: IntoIterator<Item = (P, L)>>(iter: I) -> Self {
        let mut t = PatternTable::new();
        for (p, l) in iter {
            t.insert(&p.into(), &l.into());
        }
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_wins() {
        let t = PatternTable::new().with("net", "FIRST").with("cox.net", "COX");
        assert_eq!(t.lookup("ip68.cox.net"), Some("FIRST"));
    }

    #[test]
    fn case_insensitive() {
        let t = PatternTable::default_isps();
        assert_eq!(t.lookup("be-33.Comcast.NET"), Some("COMCAST"));
        assert_eq!(t.lookup("core1.example.org"), None);
    }

    #[test]
    fn deserializes_from_pairs() {
        let t: PatternTable = serde_yaml::from_str("- [telia, TELIA]\n- [bt.net, BT]\n").unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.lookup("ae1.bt.net"), Some("BT"));
    }
}
