use std::sync::Arc;
use std::time::Duration;

use crate::errors::ScanError;
use crate::fetch::{ChildDescriptor, FetchClient, MemoryTransport};
use crate::fixtures::{self, MOVIES_LOCATOR, ROOT_LOCATOR, SEASON_LOCATOR, SHOWS_LOCATOR};
use crate::nodes::{Generation, Locator};

use super::{ScanConfig, ScanMode, Scanner};

fn scanner(transport: &Arc<MemoryTransport>) -> Scanner {
    Scanner::new(
        Arc::new(FetchClient::new(
            transport.clone(),
            fixtures::fast_fetch_config(),
        )),
        ScanConfig {
            workers: 4,
            queue_capacity: 2,
            task_retries: 3,
            retry_delay: Duration::from_millis(1),
        },
    )
}

fn movies_with(extra: ChildDescriptor) -> Vec<ChildDescriptor> {
    let mut movies = fixtures::CATALOG
        .iter()
        .find(|(l, _)| l.as_str() == MOVIES_LOCATOR)
        .map(|(_, c)| c.clone())
        .unwrap();
    movies.push(extra);
    movies
}

fn aliens() -> ChildDescriptor {
    ChildDescriptor::file("104", "Aliens (1986).mkv", "/library/parts/104/file.mkv", 3, 1)
}

fn generation(root: crate::nodes::DirectoryNode) -> Generation {
    Generation::new(2, 1_700_000_000, root)
}

#[tokio::test]
async fn full_scan_builds_catalog() {
    let transport = Arc::new(fixtures::sample_transport());
    let outcome = scanner(&transport)
        .scan(&Generation::empty(), ScanMode::Full)
        .await
        .expect("scan must succeed");

    assert!(!outcome.is_partial());
    assert_eq!(4, outcome.stats.tasks_done);
    assert_eq!(
        fixtures::sample_generation(1).encode_tree().unwrap(),
        generation(outcome.root).encode_tree().unwrap()
    );
}

/// The order in which the remote lists children, and therefore the order in
/// which listings complete, doesn't change the tree.
#[tokio::test]
async fn listing_order_is_irrelevant() {
    let movies = movies_with(aliens());
    let mut reversed = movies.clone();
    reversed.reverse();

    let mut trees = Vec::new();
    for listing in [movies, reversed] {
        let transport = Arc::new(fixtures::sample_transport());
        transport.insert_directory(&Locator::new(MOVIES_LOCATOR), listing);
        let outcome = scanner(&transport)
            .scan(&Generation::empty(), ScanMode::Full)
            .await
            .unwrap();
        trees.push(generation(outcome.root).encode_tree().unwrap());
    }

    assert_eq!(trees[0], trees[1]);
}

/// A section that can't be listed keeps its previous contents, while the
/// others are updated.
#[tokio::test]
async fn failed_subtree_keeps_previous() {
    let transport = Arc::new(fixtures::sample_transport());
    let previous = fixtures::sample_generation(1);

    transport.insert_directory(&Locator::new(MOVIES_LOCATOR), movies_with(aliens()));
    transport.fail_listing(&Locator::new(SHOWS_LOCATOR), u32::MAX);

    let outcome = scanner(&transport)
        .scan(&previous, ScanMode::Full)
        .await
        .unwrap();
    assert!(outcome.is_partial());
    assert_eq!(vec!["/TV Shows".to_string()], outcome.stats.failed_paths);

    let next = generation(outcome.root);
    assert!(next.resolve("/Movies/Aliens (1986).mkv").is_some());
    assert!(Arc::ptr_eq(
        &previous.resolve("/TV Shows").unwrap(),
        &next.resolve("/TV Shows").unwrap()
    ));
    assert!(next
        .resolve("/TV Shows/Firefly/Season 01/S01E01 - Serenity.mkv")
        .is_some());
}

/// Without a previous version, a failed directory shows up empty.
#[tokio::test]
async fn failed_subtree_without_previous_is_empty() {
    let transport = Arc::new(fixtures::sample_transport());
    transport.fail_listing(&Locator::new(SHOWS_LOCATOR), u32::MAX);

    let outcome = scanner(&transport)
        .scan(&Generation::empty(), ScanMode::Full)
        .await
        .unwrap();
    let next = generation(outcome.root);

    let shows = next.resolve("/TV Shows").unwrap();
    let shows = shows.as_directory().unwrap();
    assert!(shows.children().is_empty());
    assert_eq!(None, shows.change_marker());
}

/// Failures within the retry budget don't show in the result.
#[tokio::test]
async fn transient_failures_are_retried() {
    let transport = Arc::new(fixtures::sample_transport());
    transport.fail_listing(&Locator::new(MOVIES_LOCATOR), 2);

    let outcome = scanner(&transport)
        .scan(&Generation::empty(), ScanMode::Full)
        .await
        .unwrap();
    assert!(!outcome.is_partial());
    assert_eq!(
        fixtures::sample_generation(1).encode_tree().unwrap(),
        generation(outcome.root).encode_tree().unwrap()
    );
}

#[tokio::test]
async fn unlistable_root_aborts() {
    let transport = Arc::new(fixtures::sample_transport());
    transport.fail_listing(&Locator::new(ROOT_LOCATOR), u32::MAX);

    let result = scanner(&transport)
        .scan(&fixtures::sample_generation(1), ScanMode::Full)
        .await;
    assert!(matches!(result, Err(ScanError::Aborted(_))));
}

#[tokio::test]
async fn no_sections_aborts() {
    let transport = Arc::new(MemoryTransport::new(Locator::new(ROOT_LOCATOR)));

    let result = scanner(&transport)
        .scan(&Generation::empty(), ScanMode::Full)
        .await;
    assert!(matches!(result, Err(ScanError::Aborted(_))));
}

#[tokio::test]
async fn rejected_token_stops_scan() {
    let transport = Arc::new(fixtures::sample_transport());
    transport.set_unauthorized(true);

    let result = scanner(&transport)
        .scan(&Generation::empty(), ScanMode::Full)
        .await;
    assert!(matches!(result, Err(ScanError::Unauthorized(_))));
}

/// Incremental scans only walk sections whose change marker moved.
#[tokio::test]
async fn incremental_reuses_unchanged_sections() {
    let transport = Arc::new(fixtures::sample_transport());
    let scanner = scanner(&transport);
    let previous = generation(
        scanner
            .scan(&Generation::empty(), ScanMode::Full)
            .await
            .unwrap()
            .root,
    );

    // Nothing changed: only the root is listed.
    let calls = transport.list_calls();
    let outcome = scanner
        .scan(&previous, ScanMode::Incremental)
        .await
        .unwrap();
    assert_eq!(calls + 1, transport.list_calls());
    assert_eq!(2, outcome.stats.reused_subtrees);
    let next = generation(outcome.root);
    assert!(Arc::ptr_eq(
        &previous.resolve("/Movies").unwrap(),
        &next.resolve("/Movies").unwrap()
    ));

    // A change the marker doesn't reflect goes unnoticed.
    transport.insert_directory(&Locator::new(MOVIES_LOCATOR), movies_with(aliens()));
    let next = generation(
        scanner
            .scan(&previous, ScanMode::Incremental)
            .await
            .unwrap()
            .root,
    );
    assert!(next.resolve("/Movies/Aliens (1986).mkv").is_none());

    // Once the marker moves, the section is walked again.
    transport.insert_directory(
        &Locator::new(ROOT_LOCATOR),
        vec![
            ChildDescriptor::directory("1", "Movies", MOVIES_LOCATOR, Some(101)),
            ChildDescriptor::directory(
                "2",
                "TV Shows",
                SHOWS_LOCATOR,
                Some(fixtures::SHOWS_MARKER),
            ),
        ],
    );
    let outcome = scanner
        .scan(&previous, ScanMode::Incremental)
        .await
        .unwrap();
    assert_eq!(1, outcome.stats.reused_subtrees);
    let next = generation(outcome.root);
    assert!(next.resolve("/Movies/Aliens (1986).mkv").is_some());
    assert_eq!(
        Some(101),
        next.resolve("/Movies")
            .unwrap()
            .as_directory()
            .unwrap()
            .change_marker()
    );
    assert!(Arc::ptr_eq(
        &previous.resolve("/TV Shows").unwrap(),
        &next.resolve("/TV Shows").unwrap()
    ));
}

/// A section with a nested listing failure doesn't take the new marker, so
/// the next incremental pass walks it again.
#[tokio::test]
async fn nested_failure_is_retried_by_next_incremental() {
    let transport = Arc::new(fixtures::sample_transport());
    let scanner = scanner(&transport);
    let previous = generation(
        scanner
            .scan(&Generation::empty(), ScanMode::Full)
            .await
            .unwrap()
            .root,
    );

    transport.insert_directory(
        &Locator::new(ROOT_LOCATOR),
        vec![
            ChildDescriptor::directory("1", "Movies", MOVIES_LOCATOR, Some(fixtures::MOVIES_MARKER)),
            ChildDescriptor::directory("2", "TV Shows", SHOWS_LOCATOR, Some(201)),
        ],
    );
    transport.insert_directory(
        &Locator::new(SEASON_LOCATOR),
        vec![
            ChildDescriptor::file("203", "S01E01 - Serenity.mkv", fixtures::PILOT_LOCATOR, 3, 1),
            ChildDescriptor::file("204", "S01E02 - The Train Job.mkv", "/library/parts/204/file.mkv", 3, 1),
        ],
    );
    transport.fail_listing(&Locator::new(SEASON_LOCATOR), u32::MAX);

    let outcome = scanner
        .scan(&previous, ScanMode::Incremental)
        .await
        .unwrap();
    assert!(outcome.is_partial());
    assert_eq!(
        vec!["/TV Shows/Firefly/Season 01".to_string()],
        outcome.stats.failed_paths
    );
    let partial = generation(outcome.root);
    assert!(partial
        .resolve("/TV Shows/Firefly/Season 01/S01E01 - Serenity.mkv")
        .is_some());
    for path in ["/TV Shows", "/TV Shows/Firefly"] {
        assert_eq!(
            None,
            partial.resolve(path).unwrap().as_directory().unwrap().change_marker(),
            "{path} must not look up to date"
        );
    }

    // the remote recovers.
    transport.fail_listing(&Locator::new(SEASON_LOCATOR), 0);
    let outcome = scanner
        .scan(&partial, ScanMode::Incremental)
        .await
        .unwrap();
    assert!(!outcome.is_partial());
    assert_eq!(1, outcome.stats.reused_subtrees);
    let next = generation(outcome.root);
    assert!(next
        .resolve("/TV Shows/Firefly/Season 01/S01E02 - The Train Job.mkv")
        .is_some());
    assert_eq!(
        Some(201),
        next.resolve("/TV Shows")
            .unwrap()
            .as_directory()
            .unwrap()
            .change_marker()
    );
}

/// A full scan ignores markers.
#[tokio::test]
async fn full_scan_ignores_markers() {
    let transport = Arc::new(fixtures::sample_transport());
    let previous = fixtures::sample_generation(1);
    transport.insert_directory(&Locator::new(MOVIES_LOCATOR), movies_with(aliens()));

    let outcome = scanner(&transport)
        .scan(&previous, ScanMode::Full)
        .await
        .unwrap();
    assert_eq!(0, outcome.stats.reused_subtrees);
    assert!(generation(outcome.root)
        .resolve("/Movies/Aliens (1986).mkv")
        .is_some());
}

/// Siblings with the same title get their ids appended.
#[tokio::test]
async fn colliding_names_are_disambiguated() {
    let transport = Arc::new(fixtures::sample_transport());
    transport.insert_directory(
        &Locator::new(MOVIES_LOCATOR),
        movies_with(ChildDescriptor::file(
            "105",
            "Alien (1979).mkv",
            "/library/parts/105/file.mkv",
            3,
            1,
        )),
    );

    let next = generation(
        scanner(&transport)
            .scan(&Generation::empty(), ScanMode::Full)
            .await
            .unwrap()
            .root,
    );
    let movies = next.resolve("/Movies").unwrap();
    let names: Vec<&String> = movies.as_directory().unwrap().children().keys().collect();
    assert_eq!(
        vec![
            "Alien (1979) [101].mkv",
            "Alien (1979) [105].mkv",
            "Heat (1995).mkv"
        ],
        names
    );
}

#[tokio::test]
async fn rescan_subtree_grafts_result() {
    let transport = Arc::new(fixtures::sample_transport());
    let previous = fixtures::sample_generation(1);

    transport.insert_directory(
        &Locator::new(SEASON_LOCATOR),
        vec![
            ChildDescriptor::file(
                "203",
                "S01E01 - Serenity.mkv",
                fixtures::PILOT_LOCATOR,
                fixtures::PILOT_CONTENTS.len() as u64,
                1_700_000_000,
            ),
            ChildDescriptor::file(
                "204",
                "S01E02 - The Train Job.mkv",
                "/library/parts/204/file.mkv",
                10,
                1_700_000_001,
            ),
        ],
    );

    let calls = transport.list_calls();
    let outcome = scanner(&transport)
        .rescan_subtree(&previous, "/TV Shows/Firefly")
        .await
        .unwrap();
    // Firefly and its season, nothing else.
    assert_eq!(calls + 2, transport.list_calls());

    let next = generation(outcome.root);
    assert!(next
        .resolve("/TV Shows/Firefly/Season 01/S01E02 - The Train Job.mkv")
        .is_some());
    assert!(Arc::ptr_eq(
        &previous.resolve("/Movies").unwrap(),
        &next.resolve("/Movies").unwrap()
    ));
}

#[tokio::test]
async fn rescan_subtree_needs_directory() {
    let transport = Arc::new(fixtures::sample_transport());
    let previous = fixtures::sample_generation(1);
    let scanner = scanner(&transport);

    assert_eq!(
        ScanError::NotADirectory("/Movies/Alien (1979).mkv".into()),
        scanner
            .rescan_subtree(&previous, "/Movies/Alien (1979).mkv")
            .await
            .unwrap_err()
    );
    assert!(matches!(
        scanner.rescan_subtree(&previous, "/Nope").await,
        Err(ScanError::NotADirectory(_))
    ));
}

#[tokio::test]
async fn rescan_subtree_failure_changes_nothing() {
    let transport = Arc::new(fixtures::sample_transport());
    transport.fail_listing(&Locator::new(MOVIES_LOCATOR), u32::MAX);

    let result = scanner(&transport)
        .rescan_subtree(&fixtures::sample_generation(1), "/Movies")
        .await;
    assert!(matches!(result, Err(ScanError::Aborted(_))));
}
