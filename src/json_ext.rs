use serde_json_bytes::{ByteString, Map, Value};
use std::fmt;

/// A JSON object shaped the way raw backend data is shaped.
pub type Object = Map<ByteString, Value>;

/// One step of a [`Path`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathElement {
    /// A key within an object.
    Key(String),

    /// An index within an array.
    Index(usize),
}

/// A selector into already-resolved JSON data.
///
/// Paths are built once at plan time and applied repeatedly at execution
/// time, both for result extraction and for object-variable arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// A single-key path.
    pub fn key(key: impl Into<String>) -> Self {
        Self(vec![PathElement::Key(key.into())])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, element: PathElement) {
        self.0.push(element);
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathElement> {
        self.0.iter()
    }
}

impl From<&str> for Path {
    /// Parses a dotted selector; numeric segments index into arrays.
    fn from(s: &str) -> Self {
        Self(
            s.split('.')
                .filter(|segment| !segment.is_empty())
                .map(|segment| match segment.parse::<usize>() {
                    Ok(index) => PathElement::Index(index),
                    Err(_) => PathElement::Key(segment.to_string()),
                })
                .collect(),
        )
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, element) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            match element {
                PathElement::Key(key) => write!(f, "{}", key)?,
                PathElement::Index(index) => write!(f, "{}", index)?,
            }
        }
        Ok(())
    }
}

pub trait ValueExt {
    /// Follows `path` into the value, returning `None` when any step is
    /// missing or of the wrong shape.
    fn get_path<'a>(&'a self, path: &Path) -> Option<&'a Value>;
}

impl ValueExt for Value {
    fn get_path<'a>(&'a self, path: &Path) -> Option<&'a Value> {
        let mut current = self;
        for element in path.iter() {
            current = match element {
                PathElement::Key(key) => current.as_object()?.get(key.as_str())?,
                PathElement::Index(index) => current.as_array()?.get(*index)?,
            };
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json_bytes::json;

    #[test]
    fn path_from_dotted_string() {
        assert_eq!(
            Path::from("user.friends.0.name"),
            Path(vec![
                PathElement::Key("user".to_string()),
                PathElement::Key("friends".to_string()),
                PathElement::Index(0),
                PathElement::Key("name".to_string()),
            ])
        );
        assert_eq!(Path::from(""), Path::empty());
    }

    #[test]
    fn path_display_round_trips() {
        let path = Path::from("a.b.1");
        assert_eq!(path.to_string(), "a.b.1");
    }

    #[test]
    fn get_path_follows_keys_and_indexes() {
        let data = json!({"user": {"friends": [{"name": "ada"}, {"name": "grace"}]}});
        assert_eq!(
            data.get_path(&Path::from("user.friends.1.name")),
            Some(&json!("grace"))
        );
        assert_eq!(data.get_path(&Path::from("user.missing")), None);
        assert_eq!(data.get_path(&Path::from("user.friends.7")), None);
        assert_eq!(data.get_path(&Path::empty()), Some(&data));
    }
}
