use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Fixed, ordered class names. Index `i` is the label value of class `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct ClassList {
    names: Vec<String>,
}

impl ClassList {
    pub fn new<I, S>(names: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();

        if names.len() < 2 {
            return Err(ConfigError::invalid(format!(
                "at least 2 classes are required, got {}",
                names.len()
            )));
        }

        let mut seen = HashSet::with_capacity(names.len());
        for name in &names {
            if name.trim().is_empty() {
                return Err(ConfigError::invalid("class names must not be blank"));
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::invalid(format!("duplicate class name '{name}'")));
            }
        }

        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Always false; a class list holds at least two names.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, label: usize) -> Option<&str> {
        self.names.get(label).map(String::as_str)
    }

    pub fn contains(&self, label: usize) -> bool {
        label < self.names.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

impl TryFrom<Vec<String>> for ClassList {
    type Error = ConfigError;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(names)
    }
}

impl From<ClassList> for Vec<String> {
    fn from(list: ClassList) -> Self {
        list.names
    }
}

impl Default for ClassList {
    fn default() -> Self {
        Self {
            names: ["啊", "哦", "呀", "嗯", "Other"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_has_five_classes() {
        let classes = ClassList::default();
        assert_eq!(classes.len(), 5);
        assert_eq!(classes.name(4), Some("Other"));
        assert_eq!(classes.name(5), None);
    }

    #[test]
    fn rejects_single_class() {
        assert!(ClassList::new(["only"]).is_err());
    }

    #[test]
    fn rejects_duplicates_and_blanks() {
        assert!(ClassList::new(["yes", "yes"]).is_err());
        assert!(ClassList::new(["yes", "  "]).is_err());
    }

    #[test]
    fn label_range() {
        let classes = ClassList::new(["yes", "no"]).unwrap();
        assert!(classes.contains(1));
        assert!(!classes.contains(2));
        assert_eq!(classes.position("no"), Some(1));
    }

    #[test]
    fn deserializes_through_validation() {
        let parsed: Result<ClassList, _> = serde_json::from_str(r#"["a"]"#);
        assert!(parsed.is_err());

        let parsed: ClassList = serde_json::from_str(r#"["a", "b"]"#).unwrap();
        assert_eq!(parsed.len(), 2);
    }
}
