/// event tags: a list of string lists, the first element naming the tag
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Tags(pub Vec<Vec<String>>);

impl Tags {
    /// build tags from (name, value) pairs
    pub fn pairs<'a>(items: impl IntoIterator<Item = (&'a str, String)>) -> Self {
        Self(
            items
                .into_iter()
                .map(|(name, value)| vec![name.to_string(), value])
                .collect(),
        )
    }

    /// the first value carried by a tag with this name
    pub fn value_of(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|tag| tag.len() >= 2 && tag[0] == name)
            .map(|tag| tag[1].as_str())
    }

    /// whether any tag with this name carries one of the given values
    pub fn any_match(&self, name: &str, values: &[String]) -> bool {
        self.0
            .iter()
            .any(|tag| tag.len() >= 2 && tag[0] == name && values.contains(&tag[1]))
    }
}
