//! Plex Media Server JSON responses, and how their entries map to the
//! virtual tree.
use serde::Deserialize;

use super::ChildDescriptor;

/// The locator of the catalog root.
pub const SECTIONS_PATH: &str = "/library/sections";

/// Page sizes tried for section listings, largest first. A failing page is
/// retried with the next smaller size, a successful one resets to the start.
pub const PAGE_SIZES: [u32; 4] = [500, 200, 100, 50];

#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(rename = "MediaContainer")]
    pub media_container: MediaContainer,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaContainer {
    #[serde(default)]
    pub size: Option<u32>,
    #[serde(default)]
    pub total_size: Option<u32>,
    #[serde(default, rename = "Directory")]
    pub directories: Vec<SectionEntry>,
    #[serde(default, rename = "Metadata")]
    pub metadata: Vec<MetadataEntry>,
}

/// A library section, as listed by `/library/sections`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SectionEntry {
    pub key: String,
    pub title: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub updated_at: Option<u64>,
    #[serde(default)]
    pub content_changed_at: Option<u64>,
}

/// A movie, show, season or episode.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataEntry {
    pub rating_key: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub year: Option<u32>,
    /// Season number for seasons, episode number for episodes.
    #[serde(default)]
    pub index: Option<u32>,
    /// Season number for episodes.
    #[serde(default)]
    pub parent_index: Option<u32>,
    #[serde(default)]
    pub updated_at: Option<u64>,
    #[serde(default)]
    pub added_at: Option<u64>,
    #[serde(default, rename = "Media")]
    pub media: Vec<Media>,
}

#[derive(Debug, Deserialize)]
pub struct Media {
    #[serde(default, rename = "Part")]
    pub parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
pub struct Part {
    pub key: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl SectionEntry {
    /// Only movie and show sections are exposed.
    pub fn is_supported(&self) -> bool {
        matches!(self.kind.as_str(), "movie" | "show")
    }

    pub fn to_descriptor(&self) -> ChildDescriptor {
        let marker = match (self.content_changed_at, self.updated_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        ChildDescriptor::directory(
            self.key.clone(),
            self.title.clone(),
            format!("{}/{}/all", SECTIONS_PATH, self.key),
            marker,
        )
    }
}

impl MetadataEntry {
    fn title(&self) -> &str {
        match self.title.as_deref() {
            Some(t) if !t.trim().is_empty() => t,
            _ => "Unknown",
        }
    }

    fn first_part(&self) -> Option<&Part> {
        self.media.first().and_then(|m| m.parts.first())
    }

    fn modified(&self) -> u64 {
        self.updated_at.or(self.added_at).unwrap_or_default()
    }

    fn children_locator(&self) -> String {
        format!("/library/metadata/{}/children", self.rating_key)
    }

    /// Maps an entry to a tree node. Entries of unsupported types and media
    /// without any part are skipped.
    pub fn to_descriptor(&self) -> Option<ChildDescriptor> {
        match self.kind.as_str() {
            "movie" => {
                let part = self.first_part()?;
                let name = format!(
                    "{} ({}){}",
                    self.title(),
                    self.year.unwrap_or(0),
                    extension(part)
                );
                Some(self.file_descriptor(name, part))
            }
            "show" => Some(ChildDescriptor::directory(
                self.rating_key.clone(),
                self.title(),
                self.children_locator(),
                None,
            )),
            "season" => Some(ChildDescriptor::directory(
                self.rating_key.clone(),
                format!("Season {:02}", self.index.unwrap_or(0)),
                self.children_locator(),
                None,
            )),
            "episode" => {
                let part = self.first_part()?;
                let name = format!(
                    "S{:02}E{:02} - {}{}",
                    self.parent_index.unwrap_or(0),
                    self.index.unwrap_or(0),
                    self.title(),
                    extension(part)
                );
                Some(self.file_descriptor(name, part))
            }
            _ => None,
        }
    }

    fn file_descriptor(&self, name: String, part: &Part) -> ChildDescriptor {
        ChildDescriptor::file(
            self.rating_key.clone(),
            name,
            part.key.clone(),
            part.size.unwrap_or(0),
            self.modified(),
        )
    }
}

/// The extension (with its dot) of the part's file on the server, or an
/// empty string.
fn extension(part: &Part) -> String {
    let file = part.file.as_deref().unwrap_or_default();
    let base = file.rsplit(['/', '\\']).next().unwrap_or_default();
    match base.rfind('.') {
        Some(i) if i > 0 && i + 1 < base.len() => base[i..].to_string(),
        _ => String::new(),
    }
}
