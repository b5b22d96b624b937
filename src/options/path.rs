use crate::options::OptionError;
use std::fmt;
use std::str::FromStr;

/// One dotted component: a name, optionally qualified by an instance
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub instance: Option<String>,
}

/// `section.option[instance]` style option address
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct OptionPath {
    segments: Vec<Segment>,
}

impl OptionPath {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The first `len` segments, formatted like the path itself
    pub fn prefix(&self, len: usize) -> String {
        OptionPath {
            segments: self.segments[..len.min(self.segments.len())].to_vec(),
        }
        .to_string()
    }
}

fn parse_segment(text: &str, path: &str) -> Result<Segment, OptionError> {
    let invalid = || OptionError::InvalidPath(path.to_owned());
    let (name, instance) = match text.split_once('[') {
        Some((name, rest)) => {
            let instance = rest.strip_suffix(']').ok_or_else(invalid)?;
            if instance.is_empty() || instance.contains(['[', ']']) {
                return Err(invalid());
            }
            (name, Some(instance.to_owned()))
        }
        None if text.contains(']') => return Err(invalid()),
        None => (text, None),
    };
    if name.is_empty() || name.contains(char::is_whitespace) {
        return Err(invalid());
    }
    Ok(Segment {
        name: name.to_owned(),
        instance,
    })
}

impl FromStr for OptionPath {
    type Err = OptionError;

    /// Dots inside an instance qualifier don't split the path: `log[/var/log/a.log].level`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        let mut depth = 0usize;
        let mut start = 0;
        for (i, c) in s.char_indices() {
            match c {
                '[' => depth += 1,
                ']' => depth = depth.saturating_sub(1),
                '.' if depth == 0 => {
                    segments.push(parse_segment(&s[start..i], s)?);
                    start = i + 1;
                }
                _ => {}
            }
        }
        segments.push(parse_segment(&s[start..], s)?);
        Ok(Self { segments })
    }
}

impl fmt::Display for OptionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, seg) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str(".")?;
            }
            f.write_str(&seg.name)?;
            if let Some(instance) = &seg.instance {
                write!(f, "[{}]", instance)?;
            }
        }
        Ok(())
    }
}
