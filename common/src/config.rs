//! Configuration types: runtime and output settings, and the host inventory

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}

impl OutputConfig {
    /// Default log filter directive for the configured verbosity.
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}

/// Which way the files of a node's directory map travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    /// Local to remote.
    Put,
    /// Remote to local.
    Get,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Put => write!(f, "PUT"),
            Direction::Get => write!(f, "GET"),
        }
    }
}

/// One local/remote path pair of a batch job.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DirPair {
    pub local: String,
    pub remote: String,
}

/// A named connection target from the inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Node {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(
        default,
        deserialize_with = "deserialize_port",
        skip_serializing_if = "Option::is_none"
    )]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keypath: Option<std::path::PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Node>,
    #[serde(default, rename = "lr-map", skip_serializing_if = "Vec::is_empty")]
    pub lr_map: Vec<DirPair>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}", self.name, self.host)?;
        if let Some(direction) = self.direction {
            write!(f, " - {direction}")?;
        }
        write!(f, ")")
    }
}

#[derive(serde::Deserialize)]
#[serde(untagged)]
enum PortValue {
    Number(u16),
    Text(String),
}

// ports show up both as `port: 22` and `port: "22"`
fn deserialize_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::Deserialize;
    match Option::<PortValue>::deserialize(deserializer)? {
        None => Ok(None),
        Some(PortValue::Number(port)) => Ok(Some(port)),
        Some(PortValue::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(PortValue::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid port {text:?}"))),
    }
}

/// File names searched for, in order, first in the home directory and then in the current one.
pub const INVENTORY_FILE_NAMES: [&str; 3] = [".scpw", ".scpw.yml", ".scpw.yaml"];

/// The list of nodes loaded from an inventory file.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub nodes: Vec<Node>,
    /// File the nodes were read from.
    pub source: std::path::PathBuf,
}

impl Inventory {
    pub fn parse(text: &str) -> anyhow::Result<Vec<Node>> {
        let nodes: Option<Vec<Node>> = serde_yaml::from_str(text)?;
        Ok(nodes.unwrap_or_default())
    }

    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read inventory {:?}", path))?;
        let nodes =
            Self::parse(&text).with_context(|| format!("failed to parse inventory {:?}", path))?;
        Ok(Self {
            nodes,
            source: path.to_owned(),
        })
    }

    /// Candidate inventory paths in search order.
    pub fn search_paths(home: Option<&std::path::Path>) -> Vec<std::path::PathBuf> {
        let mut paths = vec![];
        if let Some(home) = home {
            paths.extend(INVENTORY_FILE_NAMES.iter().map(|name| home.join(name)));
        }
        paths.extend(INVENTORY_FILE_NAMES.iter().map(std::path::PathBuf::from));
        paths
    }

    /// Loads the first inventory file found in the home directory or the current directory.
    pub fn discover() -> anyhow::Result<Self> {
        let home = std::env::var_os("HOME").map(std::path::PathBuf::from);
        for path in Self::search_paths(home.as_deref()) {
            if path.is_file() {
                tracing::debug!("using inventory {:?}", &path);
                return Self::load(&path);
            }
        }
        Err(anyhow::anyhow!(
            "cannot find an inventory ({}) in {:?} or the current directory",
            INVENTORY_FILE_NAMES.join(", "),
            home.unwrap_or_default()
        ))
    }

    /// Every node, parents before their children.
    pub fn flatten(&self) -> Vec<&Node> {
        fn visit<'a>(nodes: &'a [Node], out: &mut Vec<&'a Node>) {
            for node in nodes {
                out.push(node);
                visit(&node.children, out);
            }
        }
        let mut out = vec![];
        visit(&self.nodes, &mut out);
        out
    }

    /// First node named `name`, searching depth-first.
    pub fn find(&self, name: &str) -> Option<&Node> {
        self.flatten().into_iter().find(|node| node.name == name)
    }
}
