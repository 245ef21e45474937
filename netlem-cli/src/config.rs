//! Topology files.
//!
//! ```toml
//! [[nodes]]
//! name = "n1"
//! ipv4 = "10.0.0.1/24"
//!
//! [[nodes]]
//! name = "n2"
//!
//! [[links]]
//! source = "n1"
//! destination = "n2"
//! latency = 50   # ms
//! loss = 1.0     # percent
//! rate = 10      # Mbit/s
//! ```

use std::collections::HashSet;
use std::path::Path;

use netlem::{LinkProperties, LinkRequest, NodeSpec};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error("failed to read topology file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse topology file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("node {0} is declared twice")]
    DuplicateNode(String),
    #[error("link {link} references undeclared node {missing}")]
    UnknownEndpoint { link: String, missing: String },
    #[error("link {0} -> {0} connects a node to itself")]
    SelfLink(String),
    #[error("link {link}: loss {loss} is outside 0..=100")]
    Loss { link: String, loss: f64 },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct NodeEntry {
    pub(crate) name: String,
    /// Address in CIDR notation. Assigned automatically if absent or unusable.
    #[serde(default)]
    pub(crate) ipv4: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct LinkEntry {
    pub(crate) source: String,
    pub(crate) destination: String,
    #[serde(default)]
    pub(crate) uni_directional: bool,
    #[serde(default)]
    pub(crate) latency: u32,
    #[serde(default)]
    pub(crate) loss: f64,
    #[serde(default)]
    pub(crate) rate: u64,
}

impl LinkEntry {
    fn describe(&self) -> String {
        format!("{} -> {}", self.source, self.destination)
    }
}

/// Nodes and links, applied in file order.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct TopologyFile {
    #[serde(default)]
    pub(crate) nodes: Vec<NodeEntry>,
    #[serde(default)]
    pub(crate) links: Vec<LinkEntry>,
}

impl TopologyFile {
    pub(crate) fn load(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)?;
        contents.parse()
    }

    fn validate(&self) -> Result<(), Error> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(Error::DuplicateNode(node.name.clone()));
            }
        }

        for link in &self.links {
            for endpoint in [&link.source, &link.destination] {
                if !names.contains(endpoint.as_str()) {
                    return Err(Error::UnknownEndpoint {
                        link: link.describe(),
                        missing: endpoint.clone(),
                    });
                }
            }
            if link.source == link.destination {
                return Err(Error::SelfLink(link.source.clone()));
            }
            if !(0.0..=100.0).contains(&link.loss) {
                return Err(Error::Loss { link: link.describe(), loss: link.loss });
            }
        }

        Ok(())
    }

    pub(crate) fn node_specs(&self) -> impl Iterator<Item = NodeSpec> + '_ {
        self.nodes.iter().map(|node| {
            let spec = NodeSpec::new(&node.name);
            match &node.ipv4 {
                Some(ipv4) => spec.with_ipv4(ipv4),
                None => spec,
            }
        })
    }

    pub(crate) fn link_requests(&self) -> impl Iterator<Item = LinkRequest> + '_ {
        self.links.iter().map(|link| {
            let properties = LinkProperties::new(link.latency, link.loss, link.rate);
            LinkRequest::new(&link.source, &link.destination, properties)
                .uni_directional(link.uni_directional)
        })
    }
}

impl std::str::FromStr for TopologyFile {
    type Err = Error;

    /// Parse and validate.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let file: Self = toml::from_str(s)?;
        file.validate()?;
        Ok(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_NODES: &str = r#"
        [[nodes]]
        name = "n1"
        ipv4 = "10.0.0.1/24"

        [[nodes]]
        name = "n2"

        [[links]]
        source = "n1"
        destination = "n2"
        latency = 50
        loss = 1.0
        rate = 10
    "#;

    #[test]
    fn parses_nodes_and_links() {
        let file: TopologyFile = TWO_NODES.parse().unwrap();

        let nodes: Vec<_> = file.node_specs().collect();
        assert_eq!(nodes, vec![NodeSpec::new("n1").with_ipv4("10.0.0.1/24"), NodeSpec::new("n2")]);

        let links: Vec<_> = file.link_requests().collect();
        assert_eq!(links, vec![LinkRequest::new("n1", "n2", LinkProperties::new(50, 1.0, 10))]);
    }

    #[test]
    fn link_properties_default_to_zero() {
        let file: TopologyFile = r#"
            [[nodes]]
            name = "a"
            [[nodes]]
            name = "b"
            [[links]]
            source = "a"
            destination = "b"
            uni_directional = true
        "#
        .parse()
        .unwrap();

        let link = file.link_requests().next().unwrap();
        assert!(link.uni_directional);
        assert!(link.properties.is_trivial());
    }

    #[test]
    fn empty_file_is_valid() {
        assert_eq!("".parse::<TopologyFile>().unwrap(), TopologyFile::default());
    }

    #[test]
    fn rejects_invalid_topologies() {
        let duplicate = "[[nodes]]\nname = \"a\"\n[[nodes]]\nname = \"a\"\n";
        assert!(matches!(duplicate.parse::<TopologyFile>(), Err(Error::DuplicateNode(_))));

        let unknown = "[[nodes]]\nname = \"a\"\n[[links]]\nsource = \"a\"\ndestination = \"b\"\n";
        assert!(matches!(
            unknown.parse::<TopologyFile>(),
            Err(Error::UnknownEndpoint { missing, .. }) if missing == "b"
        ));

        let self_link = "[[nodes]]\nname = \"a\"\n[[links]]\nsource = \"a\"\ndestination = \"a\"\n";
        assert!(matches!(self_link.parse::<TopologyFile>(), Err(Error::SelfLink(_))));

        let loss = TWO_NODES.replace("loss = 1.0", "loss = 101.0");
        assert!(matches!(loss.parse::<TopologyFile>(), Err(Error::Loss { .. })));

        let typo = "[[nodes]]\nnmae = \"a\"\n";
        assert!(matches!(typo.parse::<TopologyFile>(), Err(Error::Parse(_))));
    }
}
