//! Transfer sources: magnet-style references and uploaded descriptors.

use super::bencode::{self, BencodeValue};
use super::EngineError;
use reqwest::Url;
use sha1::{Digest, Sha1};

/// What a client asked to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferSource {
    Magnet(String),
    Descriptor(Vec<u8>),
}

impl TransferSource {
    /// Builds a source from request fields; an uploaded descriptor wins over a
    /// reference. Returns `None` when neither carries any content.
    pub fn from_parts(magnet: Option<String>, descriptor: Option<Vec<u8>>) -> Option<Self> {
        if let Some(bytes) = descriptor.filter(|b| !b.is_empty()) {
            return Some(Self::Descriptor(bytes));
        }
        magnet
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .map(Self::Magnet)
    }
}

/// Parameters of a magnet-style reference.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: String,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
    pub web_seeds: Vec<String>,
    /// `xs`: where the full descriptor can be fetched from.
    pub exact_source: Option<String>,
}

pub fn parse_magnet(uri: &str) -> Result<MagnetLink, EngineError> {
    let url = Url::parse(uri).map_err(|e| EngineError::InvalidSource(e.to_string()))?;
    if url.scheme() != "magnet" {
        return Err(EngineError::InvalidSource(format!(
            "unsupported scheme '{}'",
            url.scheme()
        )));
    }

    let mut link = MagnetLink::default();
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "xt" => {
                let hash = value
                    .strip_prefix("urn:btih:")
                    .or_else(|| value.strip_prefix("urn:btmh:"));
                if let Some(hash) = hash {
                    link.info_hash = hash.to_ascii_lowercase();
                }
            }
            "dn" => link.display_name = Some(value.into_owned()),
            "tr" => link.trackers.push(value.into_owned()),
            "ws" => link.web_seeds.push(value.into_owned()),
            "xs" => link.exact_source = Some(value.into_owned()),
            _ => {}
        }
    }

    if link.info_hash.is_empty() || !link.info_hash.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(EngineError::InvalidSource(
            "magnet reference has no usable xt hash".into(),
        ));
    }
    Ok(link)
}

/// One file entry from a descriptor's `info` dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorFile {
    /// Path relative to the transfer's storage directory.
    pub path: String,
    pub length: u64,
}

/// The parts of a bencoded descriptor the web-seed engine needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    /// Hex SHA-1 of the raw `info` dictionary, the same value a magnet
    /// reference carries as its `btih` hash.
    pub id: String,
    pub name: String,
    pub files: Vec<DescriptorFile>,
    pub trackers: Vec<String>,
    pub web_seeds: Vec<String>,
    /// True when `info` lists several files under a directory named `name`.
    pub multi_file: bool,
}

pub fn parse_descriptor(data: &[u8]) -> Result<Descriptor, EngineError> {
    let invalid = |msg: &str| EngineError::InvalidSource(msg.to_string());

    let (root, raw_info) =
        bencode::decode_with_raw(data, "info").map_err(|e| EngineError::InvalidSource(e.to_string()))?;
    let raw_info = raw_info.ok_or_else(|| invalid("descriptor has no info dictionary"))?;
    let info = root.get("info").ok_or_else(|| invalid("descriptor has no info dictionary"))?;

    let name = info
        .get("name")
        .and_then(BencodeValue::as_string)
        .filter(|n| is_safe_component(n))
        .ok_or_else(|| invalid("descriptor has no usable name"))?;

    let (files, multi_file) = match (info.get("length"), info.get("files")) {
        (Some(length), _) => {
            let length = non_negative(length).ok_or_else(|| invalid("invalid file length"))?;
            (
                vec![DescriptorFile {
                    path: name.clone(),
                    length,
                }],
                false,
            )
        }
        (None, Some(list)) => {
            let entries = list.as_list().ok_or_else(|| invalid("files must be a list"))?;
            let mut files = Vec::with_capacity(entries.len());
            for entry in entries {
                let length = entry
                    .get("length")
                    .and_then(non_negative)
                    .ok_or_else(|| invalid("invalid file length"))?;
                let parts = entry
                    .get("path")
                    .and_then(BencodeValue::as_list)
                    .ok_or_else(|| invalid("file entry has no path"))?;
                let mut path = vec![name.clone()];
                for part in parts {
                    let part = part
                        .as_string()
                        .filter(|p| is_safe_component(p))
                        .ok_or_else(|| invalid("unsafe path component"))?;
                    path.push(part);
                }
                if path.len() < 2 {
                    return Err(invalid("file entry has an empty path"));
                }
                files.push(DescriptorFile {
                    path: path.join("/"),
                    length,
                });
            }
            (files, true)
        }
        (None, None) => return Err(invalid("descriptor lists no files")),
    };

    let mut trackers = Vec::new();
    if let Some(announce) = root.get("announce").and_then(BencodeValue::as_string) {
        trackers.push(announce);
    }
    if let Some(tiers) = root.get("announce-list").and_then(BencodeValue::as_list) {
        for tier in tiers {
            for url in tier.as_list().unwrap_or_default() {
                if let Some(url) = url.as_string().filter(|u| !trackers.contains(u)) {
                    trackers.push(url);
                }
            }
        }
    }

    let web_seeds = match root.get("url-list") {
        Some(BencodeValue::Bytes(b)) => vec![String::from_utf8_lossy(b).into_owned()],
        Some(BencodeValue::List(l)) => l.iter().filter_map(BencodeValue::as_string).collect(),
        _ => Vec::new(),
    };

    Ok(Descriptor {
        id: content_id(raw_info),
        name,
        files,
        trackers,
        web_seeds,
        multi_file,
    })
}

/// Hex SHA-1 of `data`.
pub fn content_id(data: &[u8]) -> String {
    format!("{:x}", Sha1::digest(data))
}

fn non_negative(value: &BencodeValue) -> Option<u64> {
    value.as_integer().and_then(|i| u64::try_from(i).ok())
}

fn is_safe_component(part: &str) -> bool {
    !part.is_empty() && part != "." && part != ".." && !part.contains(['/', '\\'])
}
