use std::convert::Infallible;
use std::fmt;
use std::ops::Deref;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Row id shared by bookmarks, folders, import jobs and their items.
///
/// Fresh ids are lowercase ULIDs, so ids created later sort after earlier
/// ones. Ids arriving from clients are accepted verbatim and simply fail
/// to match anything when malformed.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Eid(String);

impl Eid {
    pub fn new() -> Eid {
        let ulid = rusty_ulid::Ulid::generate();
        Eid(ulid.to_string().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Eid {
    fn default() -> Self {
        Eid::new()
    }
}

impl fmt::Display for Eid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Eid {
    type Err = Infallible;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ok(Eid::from(raw))
    }
}

impl Deref for Eid {
    type Target = String;

    fn deref(&self) -> &String {
        &self.0
    }
}

impl AsRef<str> for Eid {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Eid {
    fn from(raw: &str) -> Self {
        Eid(raw.trim().to_string())
    }
}

impl From<String> for Eid {
    fn from(raw: String) -> Self {
        match raw.trim().len() == raw.len() {
            true => Eid(raw),
            false => Eid(raw.trim().to_string()),
        }
    }
}

impl From<Eid> for String {
    fn from(id: Eid) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_sortable() {
        let a = Eid::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Eid::new();

        assert_ne!(a, b);
        assert!(a < b);
        assert_eq!(a.len(), 26);
        assert_eq!(a.as_str(), a.as_str().to_ascii_lowercase());
    }

    #[test]
    fn test_client_ids_are_trimmed() {
        assert_eq!(Eid::from(" abc "), Eid::from("abc".to_string()));
        assert_eq!("abc".parse::<Eid>().unwrap().to_string(), "abc");
        assert_eq!(serde_json::to_string(&Eid::from("abc")).unwrap(), "\"abc\"");
    }
}
