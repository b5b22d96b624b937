use crate::config::ConfigError;
use crate::connection::Address;
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// Manager topology: an ordered list of alternatives (`||`), each an AND-chain (`&&`)
/// of endpoints that must all be reachable
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Topology {
    groups: Vec<Vec<Address>>,
}

impl Topology {
    /// AND-chains in the order they are tried
    pub fn groups(&self) -> &[Vec<Address>] {
        &self.groups
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Address> {
        self.groups.iter().flatten()
    }
}

/// Whitespace separated tokens, e.g. `10.0.0.1 && 10.0.0.2 || unix`.
/// A malformed string is rejected as a whole.
impl FromStr for Topology {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut groups = Vec::new();
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut last_endpoint: Option<&str> = None;
        let mut last_operator: Option<&str> = None;

        for token in s.split_whitespace() {
            match token {
                "&&" | "||" => {
                    if last_endpoint.is_none() {
                        return Err(ConfigError::MisplacedOperator(token.to_owned()));
                    }
                    if token == "||" {
                        groups.push(std::mem::take(&mut chain));
                    }
                    last_endpoint = None;
                    last_operator = Some(token);
                }
                _ => {
                    if let Some(prev) = last_endpoint {
                        return Err(ConfigError::MissingOperator(format!("{} {}", prev, token)));
                    }
                    let addr = Address::from_str(token)?;
                    if !seen.insert(addr.clone()) {
                        return Err(ConfigError::DuplicateEndpoint(addr.to_string()));
                    }
                    chain.push(addr);
                    last_endpoint = Some(token);
                }
            }
        }

        if last_endpoint.is_none() {
            return Err(match last_operator {
                Some(op) => ConfigError::DanglingOperator(op.to_owned()),
                None => ConfigError::EmptyConnectionString,
            });
        }
        groups.push(chain);
        Ok(Self { groups })
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, chain) in self.groups.iter().enumerate() {
            if i > 0 {
                f.write_str(" || ")?;
            }
            for (j, addr) in chain.iter().enumerate() {
                if j > 0 {
                    f.write_str(" && ")?;
                }
                write!(f, "{}", addr)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn names(t: &Topology) -> Vec<Vec<String>> {
        t.groups()
            .iter()
            .map(|chain| chain.iter().map(|a| a.to_string()).collect())
            .collect()
    }

    #[test]
    fn and_or_groups() {
        let t: Topology = "a && b || c".parse().unwrap();
        assert_eq!(
            names(&t),
            vec![vec!["a:4690", "b:4690"], vec!["c:4690"]]
        );

        let t: Topology = "a".parse().unwrap();
        assert_eq!(names(&t), vec![vec!["a:4690"]]);

        let t: Topology = "  10.0.0.1:4690   ||  10.0.0.2:4690 && unix ".parse().unwrap();
        assert_eq!(t.groups().len(), 2);
        assert_eq!(t.groups()[1].len(), 2);
        assert_eq!(t.endpoints().count(), 3);
        assert_eq!(
            t.to_string(),
            "10.0.0.1:4690 || 10.0.0.2:4690 && unix:/tmp/.prelude-unix-4690"
        );
    }

    #[test]
    fn malformed_strings() {
        assert!(matches!(
            "".parse::<Topology>(),
            Err(ConfigError::EmptyConnectionString)
        ));
        assert!(matches!(
            "   ".parse::<Topology>(),
            Err(ConfigError::EmptyConnectionString)
        ));
        assert!(matches!(
            "&& a".parse::<Topology>(),
            Err(ConfigError::MisplacedOperator(_))
        ));
        assert!(matches!(
            "a || || b".parse::<Topology>(),
            Err(ConfigError::MisplacedOperator(_))
        ));
        assert!(matches!(
            "a ||".parse::<Topology>(),
            Err(ConfigError::DanglingOperator(_))
        ));
        assert!(matches!(
            "a b".parse::<Topology>(),
            Err(ConfigError::MissingOperator(_))
        ));
        assert!(matches!(
            "a && a:4690".parse::<Topology>(),
            Err(ConfigError::DuplicateEndpoint(_))
        ));
        assert!(matches!(
            "a:notaport".parse::<Topology>(),
            Err(ConfigError::Endpoint(_))
        ));
    }
}
