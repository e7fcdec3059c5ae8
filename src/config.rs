use anyhow::{anyhow, Context, Result};
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use std::fmt;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = ".coding_plan_usage_config.json";

/// Opaque vendor secret. Never printed, logged or serialized.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    #[cfg(test)]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderConfig {
    pub api_key: Credential,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_ordered")]
    pub providers: Vec<(String, ProviderConfig)>,
}

impl Config {
    #[cfg(test)]
    pub fn from_entries<I, N, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (N, K)>,
        N: Into<String>,
        K: Into<String>,
    {
        Self {
            providers: entries
                .into_iter()
                .map(|(name, key)| {
                    (
                        name.into(),
                        ProviderConfig {
                            api_key: Credential::new(key),
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_FILE_NAME)
    }

    /// Load from `path`, or from the default location when none is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::config_path);
        if !path.exists() {
            return Err(anyhow!(
                "Config file not found: {}. Expected {}",
                path.display(),
                Self::example()
            ));
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(content)?;
        Ok(config)
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    fn example() -> &'static str {
        r#"{"providers": {"kimi": {"api_key": "your-api-key"}}}"#
    }
}

/// JSON objects carry no order guarantee in serde's map types, so collect
/// the entries by hand to keep them in file order.
fn deserialize_ordered<'de, D>(deserializer: D) -> Result<Vec<(String, ProviderConfig)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OrderedVisitor;

    impl<'de> Visitor<'de> for OrderedVisitor {
        type Value = Vec<(String, ProviderConfig)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of provider name to {\"api_key\": string}")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((name, config)) = map.next_entry::<String, ProviderConfig>()? {
                entries.push((name, config));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(OrderedVisitor)
}
