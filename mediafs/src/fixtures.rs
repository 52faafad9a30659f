use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;

use crate::fetch::{BackoffPolicy, ChildDescriptor, FetchConfig, MemoryTransport};
use crate::nodes::{DirectoryNode, FileNode, Generation, Locator, Node, NodeKind};

pub const ROOT_LOCATOR: &str = "/library/sections";

pub const MOVIES_LOCATOR: &str = "/library/sections/1/all";
pub const SHOWS_LOCATOR: &str = "/library/sections/2/all";
pub const SEASON_LOCATOR: &str = "/library/metadata/202/children";

pub const ALIEN_LOCATOR: &str = "/library/parts/101/file.mkv";
pub const ALIEN_CONTENTS: &[u8] =
    b"In space no one can hear you scream. Nostromo, this is Mother. Over.";

pub const HEAT_LOCATOR: &str = "/library/parts/102/file.mkv";
pub const HEAT_CONTENTS: &[u8] = b"Don't let yourself get attached to anything.";

pub const PILOT_LOCATOR: &str = "/library/parts/203/file.mkv";
pub const PILOT_CONTENTS: &[u8] = b"Previously on nothing, because this is the pilot.";

/// Section change markers of the sample catalog.
pub const MOVIES_MARKER: u64 = 100;
pub const SHOWS_MARKER: u64 = 200;

lazy_static! {
    /// The sample catalog: listings per directory locator.
    pub static ref CATALOG: Vec<(Locator, Vec<ChildDescriptor>)> = vec![
        (
            Locator::new(ROOT_LOCATOR),
            vec![
                ChildDescriptor::directory("1", "Movies", MOVIES_LOCATOR, Some(MOVIES_MARKER)),
                ChildDescriptor::directory("2", "TV Shows", SHOWS_LOCATOR, Some(SHOWS_MARKER)),
            ],
        ),
        (
            Locator::new(MOVIES_LOCATOR),
            vec![
                ChildDescriptor::file("102", "Heat (1995).mkv", HEAT_LOCATOR, HEAT_CONTENTS.len() as u64, 1_600_000_000),
                ChildDescriptor::file("101", "Alien (1979).mkv", ALIEN_LOCATOR, ALIEN_CONTENTS.len() as u64, 1_500_000_000),
            ],
        ),
        (
            Locator::new(SHOWS_LOCATOR),
            vec![ChildDescriptor::directory(
                "201",
                "Firefly",
                "/library/metadata/201/children",
                None,
            )],
        ),
        (
            Locator::new("/library/metadata/201/children"),
            vec![ChildDescriptor::directory("202", "Season 01", SEASON_LOCATOR, None)],
        ),
        (
            Locator::new(SEASON_LOCATOR),
            vec![ChildDescriptor::file(
                "203",
                "S01E01 - Serenity.mkv",
                PILOT_LOCATOR,
                PILOT_CONTENTS.len() as u64,
                1_700_000_000,
            )],
        ),
    ];

    /// File contents of the sample catalog.
    pub static ref CONTENTS: Vec<(Locator, &'static [u8])> = vec![
        (Locator::new(ALIEN_LOCATOR), ALIEN_CONTENTS),
        (Locator::new(HEAT_LOCATOR), HEAT_CONTENTS),
        (Locator::new(PILOT_LOCATOR), PILOT_CONTENTS),
    ];
}

/// A [MemoryTransport] serving the sample catalog.
pub fn sample_transport() -> MemoryTransport {
    let transport = MemoryTransport::new(Locator::new(ROOT_LOCATOR));
    for (locator, children) in CATALOG.iter() {
        transport.insert_directory(locator, children.clone());
    }
    for (locator, contents) in CONTENTS.iter() {
        transport.insert_file(locator, *contents);
    }
    transport
}

/// Fetch settings with millisecond backoffs, and a remote that never counts
/// as down.
pub fn fast_fetch_config() -> FetchConfig {
    FetchConfig {
        backoff: BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(4),
            jitter: false,
            max_failures: u32::MAX,
            reconnect_after: Duration::from_millis(10),
        },
        request_timeout: Duration::from_secs(5),
        read_attempts: 3,
    }
}

/// The generation a full scan of [sample_transport] produces.
pub fn sample_generation(sequence: u64) -> Generation {
    Generation::new(
        sequence,
        1_700_000_000,
        sample_directory("", "", &Locator::new(ROOT_LOCATOR), None),
    )
}

fn sample_directory(
    id: &str,
    name: &str,
    locator: &Locator,
    change_marker: Option<u64>,
) -> DirectoryNode {
    let listing = CATALOG
        .iter()
        .find(|(l, _)| l == locator)
        .map(|(_, children)| children.as_slice())
        .unwrap_or_default();

    let children: BTreeMap<String, Arc<Node>> = listing
        .iter()
        .map(|child| {
            let node = match child.kind {
                NodeKind::Directory => Node::Directory(sample_directory(
                    &child.id,
                    &child.name,
                    &child.locator,
                    child.change_marker,
                )),
                NodeKind::File => Node::File(FileNode::new(
                    child.id.clone(),
                    child.name.clone(),
                    child.locator.clone(),
                    child.size,
                    child.modified,
                )),
            };
            (child.name.clone(), Arc::new(node))
        })
        .collect();

    DirectoryNode::new(id, name, locator.clone(), change_marker, children)
}
