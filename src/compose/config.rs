use crate::environment::Environment;
use eyre::{eyre, WrapErr};
use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Fully resolved project configuration as rendered by `docker compose config`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub environment: Environment,
}

impl Config {
    pub fn parse(yaml: &[u8]) -> eyre::Result<Self> {
        serde_yaml::from_slice(yaml).wrap_err("unable to parse Docker Compose configuration")
    }
}

/// A published port of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub external_ip: Option<String>,
    pub external_port: Option<u16>,
    pub internal_port: u16,
    pub protocol: String,
}

fn parse_port(text: &str, what: &str) -> eyre::Result<u16> {
    text.trim()
        .parse()
        .wrap_err_with(|| format!("invalid {what} port {text:?}"))
}

impl FromStr for PortMapping {
    type Err = eyre::Report;

    /// Parses `[[ip:]external:]internal[/protocol]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, protocol) = match s.rsplit_once('/') {
            Some((address, protocol)) if !protocol.is_empty() => (address, protocol),
            Some(_) => return Err(eyre!("missing protocol in port mapping {s:?}")),
            None => (s, "tcp"),
        };

        // Splitting from the right keeps IPv6 host addresses intact
        let mut parts = address.rsplitn(3, ':');
        let internal = parts
            .next()
            .ok_or_else(|| eyre!("missing internal port in port mapping {s:?}"))?;
        let external = parts.next().filter(|p| !p.is_empty());
        let ip = parts
            .next()
            .map(|ip| ip.trim_start_matches('[').trim_end_matches(']'))
            .filter(|ip| !ip.is_empty());

        Ok(PortMapping {
            external_ip: ip.map(str::to_string),
            external_port: external.map(|p| parse_port(p, "external")).transpose()?,
            internal_port: parse_port(internal, "internal")?,
            protocol: protocol.to_string(),
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortNumber {
    Int(u64),
    Text(String),
}

impl PortNumber {
    fn into_port(self, what: &str) -> eyre::Result<Option<u16>> {
        match self {
            PortNumber::Int(n) => u16::try_from(n)
                .map(Some)
                .map_err(|_| eyre!("{what} port {n} out of range")),
            PortNumber::Text(text) if text.trim().is_empty() => Ok(None),
            PortNumber::Text(text) => parse_port(&text, what).map(Some),
        }
    }
}

#[derive(Deserialize)]
struct LongPortSyntax {
    #[serde(default)]
    host_ip: Option<String>,
    target: PortNumber,
    #[serde(default)]
    published: Option<PortNumber>,
    #[serde(default)]
    protocol: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortSyntax {
    Short(String),
    Bare(u64),
    Long(LongPortSyntax),
}

impl TryFrom<PortSyntax> for PortMapping {
    type Error = eyre::Report;

    fn try_from(syntax: PortSyntax) -> Result<Self, Self::Error> {
        match syntax {
            PortSyntax::Short(text) => text.parse(),
            PortSyntax::Bare(n) => format!("{n}").parse(),
            PortSyntax::Long(long) => Ok(PortMapping {
                external_ip: long.host_ip.filter(|ip| !ip.is_empty()),
                external_port: match long.published {
                    Some(p) => p.into_port("published")?,
                    None => None,
                },
                internal_port: long
                    .target
                    .into_port("target")?
                    .ok_or_else(|| eyre!("port mapping without target port"))?,
                protocol: long
                    .protocol
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| "tcp".to_string()),
            }),
        }
    }
}

impl<'de> Deserialize<'de> for PortMapping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let syntax = PortSyntax::deserialize(deserializer)?;
        PortMapping::try_from(syntax).map_err(|e| de::Error::custom(format!("{e:#}")))
    }
}
