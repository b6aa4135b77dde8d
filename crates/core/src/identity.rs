use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LauncherError;

/// The database identities a launcher may be constructed for.
///
/// Each identity names one database inside the supervised cluster and owns
/// its own backup namespace (`<identity>-...`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbName {
    Phoenix,
    Mojave,
    Ventura,
}

impl DbName {
    pub const ALL: [DbName; 3] = [DbName::Phoenix, DbName::Mojave, DbName::Ventura];

    pub fn as_str(self) -> &'static str {
        match self {
            DbName::Phoenix => "phoenix",
            DbName::Mojave => "mojave",
            DbName::Ventura => "ventura",
        }
    }
}

impl fmt::Display for DbName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbName {
    type Err = LauncherError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        DbName::ALL
            .into_iter()
            .find(|name| name.as_str() == raw)
            .ok_or_else(|| LauncherError::UnknownDatabase {
                name: raw.to_owned(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_known_identity() {
        for name in DbName::ALL {
            assert_eq!(name.as_str().parse::<DbName>().unwrap(), name);
        }
    }

    #[test]
    fn refuses_unknown_and_empty_names() {
        for raw in ["", "postgres", "Mojave", "mojave "] {
            let err = raw.parse::<DbName>().unwrap_err();
            assert!(matches!(err, LauncherError::UnknownDatabase { .. }), "{raw:?}");
        }
    }
}
