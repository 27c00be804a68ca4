use std::collections::HashMap;
use std::sync::Arc;

use assert_matches::assert_matches;
use rstest::*;
use tempfile::TempDir;

use crate::artifact::{Artifact, ArtifactError, ArtifactStore, PullOutcome, ZipIndexError};
use crate::core::client::storage::{StorageClient, StorageError};
use crate::tests::common::{read_tree, write_tree, MemoryStorage, StorageRequest};

struct Fixture {
    storage: Arc<MemoryStorage>,
    store: ArtifactStore,
    workspace: TempDir,
}

#[fixture]
fn fixture() -> Fixture {
    let storage = Arc::new(MemoryStorage::new());
    let workspace = TempDir::new().unwrap();
    let store = ArtifactStore::new(storage.clone(), workspace.path());
    Fixture { storage, store, workspace }
}

fn source_dir(files: &[(&str, &[u8])]) -> TempDir {
    let dir = TempDir::new().unwrap();
    write_tree(dir.path(), files);
    dir
}

/// Push a directory with an index, pull it elsewhere, then read one member with a single ranged
/// request sized to its compressed payload.
#[rstest]
#[tokio::test]
async fn push_pull_and_extract_one_member(fixture: Fixture) {
    let source = source_dir(&[("a.txt", b"xxxxx"), ("b/c.txt", b"yyy")]);
    let artifact = Artifact::new("P", "name");

    fixture.store.push(source.path(), &artifact, true).await.unwrap();
    assert_eq!(fixture.storage.keys(), vec!["P/name.zip".to_string(), "P/name.zip.index".to_string()]);

    let target = fixture.workspace.path().join("pulled");
    let outcome = fixture.store.pull(&target, &artifact, false).await.unwrap();
    assert_eq!(outcome, PullOutcome::Pulled);
    assert_eq!(read_tree(&target), read_tree(source.path()));

    let entry = fixture.store.load_index(&artifact).await.unwrap().find("b/c.txt").unwrap().clone();
    fixture.storage.clear_requests();

    let content = fixture.store.extract_file(&artifact, "b/c.txt").await.unwrap();
    assert_eq!(&content[..], b"yyy");

    let requests = fixture.storage.requests();
    assert_eq!(requests[0], StorageRequest::Get(artifact.index_key()));
    let ranged: Vec<_> = requests
        .iter()
        .filter_map(|request| match request {
            StorageRequest::GetRange(key, range) => Some((key.clone(), *range)),
            _ => None,
        })
        .collect();
    assert_eq!(ranged.len(), 1);
    assert_eq!(ranged[0].0, artifact.key());
    assert_eq!(ranged[0].1.size(), entry.compress_size);
    assert!(!requests.contains(&StorageRequest::Get(artifact.key())), "the archive must not be downloaded");
}

#[rstest]
#[tokio::test]
async fn every_indexed_member_can_be_extracted(fixture: Fixture) {
    let files: &[(&str, &[u8])] = &[
        ("cameras.txt", b"1 PINHOLE 1920 1080"),
        ("images/0001.txt", b"first"),
        ("images/0002.txt", b"second"),
        ("point_cloud/iteration_7000/point_cloud.ply", &[0u8, 1, 2, 3, 255, 254]),
    ];
    let source = source_dir(files);
    let artifact = Artifact::new("42", "splat");
    fixture.store.push(source.path(), &artifact, true).await.unwrap();

    let index = fixture.store.load_index(&artifact).await.unwrap();
    assert_eq!(index.len(), files.len());

    for (name, content) in files {
        let entry = index.find(name).unwrap();
        assert_eq!(&fixture.store.extract_entry(&artifact, entry).await.unwrap()[..], *content);
    }
}

#[rstest]
#[tokio::test]
async fn empty_member_is_extracted(fixture: Fixture) {
    let source = source_dir(&[("empty.log", b""), ("full.log", b"content")]);
    let artifact = Artifact::new("1", "colmap");
    fixture.store.push(source.path(), &artifact, true).await.unwrap();

    assert!(fixture.store.extract_file(&artifact, "empty.log").await.unwrap().is_empty());
    assert_eq!(&fixture.store.extract_file(&artifact, "full.log").await.unwrap()[..], b"content");
}

#[cfg(unix)]
#[rstest]
#[tokio::test]
async fn symlink_members_are_indexed_and_extracted(fixture: Fixture) {
    let source = source_dir(&[("a.txt", b"xxxxx")]);
    std::os::unix::fs::symlink("a.txt", source.path().join("link.txt")).unwrap();
    let artifact = Artifact::new("P", "links");

    fixture.store.push(source.path(), &artifact, true).await.unwrap();

    let index = fixture.store.load_index(&artifact).await.unwrap();
    assert_eq!(index.names().collect::<Vec<_>>(), vec!["a.txt", "link.txt"]);
    assert_eq!(&fixture.store.extract_file(&artifact, "link.txt").await.unwrap()[..], b"a.txt");
    assert_eq!(&fixture.store.extract_file(&artifact, "a.txt").await.unwrap()[..], b"xxxxx");
}

#[rstest]
#[case(b"a.txt,18446744073709551615,2\n".as_slice())]
#[case(b"a.txt,5,18446744073709551615\n".as_slice())]
#[tokio::test]
async fn corrupt_index_ranges_fail_without_a_ranged_read(fixture: Fixture, #[case] index: &[u8]) {
    let artifact = Artifact::new("P", "broken");
    fixture.storage.insert(&artifact.key(), b"not really a zip".to_vec());
    fixture.storage.insert(&artifact.index_key(), index.to_vec());

    let result = fixture.store.extract_file(&artifact, "a.txt").await;

    assert_matches!(result, Err(ArtifactError::IndexError(ZipIndexError::IndexCorrupt { name, .. })) if name == "a.txt");
    assert!(!fixture.storage.requests().iter().any(|request| matches!(request, StorageRequest::GetRange(..))));
}

#[rstest]
#[tokio::test]
async fn pushing_without_index_uploads_only_the_archive(fixture: Fixture) {
    let source = source_dir(&[("pairs.txt", b"a.jpg b.jpg")]);
    let artifact = Artifact::new("3", "pairing");

    fixture.store.push(source.path(), &artifact, false).await.unwrap();

    assert_eq!(fixture.storage.keys(), vec![artifact.key()]);
    assert_matches!(
        fixture.store.extract_file(&artifact, "pairs.txt").await,
        Err(ArtifactError::StorageError(StorageError::NotFound(key))) if key == artifact.index_key()
    );
}

#[rstest]
#[tokio::test]
async fn empty_directory_is_not_pushed(fixture: Fixture) {
    let source = TempDir::new().unwrap();

    let result = fixture.store.push(source.path(), &Artifact::new("1", "frames"), true).await;

    assert_matches!(result, Err(ArtifactError::EmptyArtifact(_)));
    assert!(fixture.storage.requests().is_empty());
}

#[rstest]
#[tokio::test]
async fn missing_directory_is_not_pushed(fixture: Fixture) {
    let missing = fixture.workspace.path().join("does-not-exist");
    let result = fixture.store.push(&missing, &Artifact::new("1", "frames"), false).await;
    assert_matches!(result, Err(ArtifactError::MissingDirectory(_)));
}

#[rstest]
#[tokio::test]
async fn pulling_a_missing_artifact_fails(fixture: Fixture) {
    let target = fixture.workspace.path().join("1").join("frames");

    let result = fixture.store.pull(&target, &Artifact::new("1", "frames"), false).await;

    assert_matches!(result, Err(ArtifactError::StorageError(StorageError::NotFound(_))));
    assert!(!target.exists());
}

#[rstest]
#[tokio::test]
async fn extracting_an_unknown_member_fails(fixture: Fixture) {
    let source = source_dir(&[("a.txt", b"a")]);
    let artifact = Artifact::new("1", "frames");
    fixture.store.push(source.path(), &artifact, true).await.unwrap();

    let result = fixture.store.extract_file(&artifact, "b.txt").await;

    assert_matches!(result, Err(ArtifactError::IndexError(ZipIndexError::EntryNotFound(name))) if name == "b.txt");
}

#[rstest]
#[case(false, PullOutcome::Skipped, b"local".as_slice())]
#[case(true, PullOutcome::Pulled, b"remote".as_slice())]
#[tokio::test]
async fn existing_local_content_is_kept_unless_replaced(
    fixture: Fixture,
    #[case] replace_existing: bool,
    #[case] expected_outcome: PullOutcome,
    #[case] expected_content: &[u8],
) {
    let source = source_dir(&[("data.txt", b"remote")]);
    let artifact = Artifact::new("5", "frames");
    fixture.store.push(source.path(), &artifact, false).await.unwrap();

    let target = fixture.store.local_path(&artifact);
    write_tree(&target, &[("data.txt", b"local"), ("stale.txt", b"stale")]);
    fixture.storage.clear_requests();

    let outcome = fixture.store.pull(&target, &artifact, replace_existing).await.unwrap();

    assert_eq!(outcome, expected_outcome);
    assert_eq!(std::fs::read(target.join("data.txt")).unwrap(), expected_content);
    assert_eq!(target.join("stale.txt").exists(), !replace_existing);
    assert_eq!(fixture.storage.requests().is_empty(), !replace_existing);
}

#[rstest]
#[tokio::test]
async fn local_and_remote_existence_are_separate(fixture: Fixture) {
    let source = source_dir(&[("a.txt", b"a")]);
    let artifact = Artifact::new("9", "frames");

    assert!(!fixture.store.exists(&artifact));
    assert!(!fixture.store.exists_remote(&artifact).await.unwrap());

    fixture.store.push(source.path(), &artifact, false).await.unwrap();
    assert!(!fixture.store.exists(&artifact));
    assert!(fixture.store.exists_remote(&artifact).await.unwrap());

    fixture.store.pull(&fixture.store.local_path(&artifact), &artifact, false).await.unwrap();
    assert!(fixture.store.exists(&artifact));
}

#[rstest]
#[tokio::test]
async fn single_files_round_trip_with_metadata(fixture: Fixture) {
    let source = source_dir(&[("scan.mp4", b"video bytes")]);
    let metadata = HashMap::from([("content-type".to_string(), "video/mp4".to_string())]);

    fixture.store.push_file(&source.path().join("scan.mp4"), "7/scan.mp4", metadata.clone()).await.unwrap();
    assert_eq!(fixture.storage.get_metadata("7/scan.mp4").await.unwrap(), metadata);

    let target = fixture.workspace.path().join("7").join("uploads").join("scan.mp4");
    assert_eq!(fixture.store.pull_file(&target, "7/scan.mp4", false).await.unwrap(), PullOutcome::Pulled);
    assert_eq!(std::fs::read(&target).unwrap(), b"video bytes");
    assert_eq!(fixture.store.pull_file(&target, "7/scan.mp4", false).await.unwrap(), PullOutcome::Skipped);
}
