//! This contains test scenarios that a given [ContentStore] needs to pass.
//! We use [rstest] and [rstest_reuse] to provide all stores we want to test
//! against, and then apply this template to all test functions.

use std::{num::NonZeroUsize, sync::Arc};

use bytes::Bytes;
use futures::TryStreamExt;
use rstest::*;
use rstest_reuse::{self, *};

use super::{ContentStore, LruContentStore, MemoryContentStore};
use crate::contentstore;
use crate::fixtures::blob_of_size;
use crate::Error;

/// This produces a template, which will be applied to all individual test functions.
/// See https://github.com/la10736/rstest/issues/130#issuecomment-968864832
#[template]
#[rstest]
#[case::memory(contentstore::from_addr("memory://").unwrap())]
#[case::objectstore_memory(contentstore::from_addr("objectstore+memory:///").unwrap())]
#[case::objectstore_memory_parallel(contentstore::from_addr("objectstore+memory:///?concurrency=4&parallel_threshold=1000").unwrap())]
#[case::lru_memory(Arc::new(LruContentStore::with_capacity(MemoryContentStore::default(), NonZeroUsize::new(16).unwrap())) as Arc<dyn ContentStore>)]
pub fn content_stores(#[case] content_store: Arc<dyn ContentStore>) {}

/// Reading a key that was never written must fail with NotFound.
#[apply(content_stores)]
#[tokio::test]
async fn get_nonexistent(content_store: Arc<dyn ContentStore>) {
    let err = content_store
        .get_content("images/abc/json")
        .await
        .expect_err("must fail");
    assert!(matches!(err, Error::NotFound(_)), "unexpected error {err:?}");

    assert!(!content_store
        .exists("images/abc/json")
        .await
        .expect("must not fail"));
}

/// Streaming a key that was never written must fail with NotFound.
#[apply(content_stores)]
#[tokio::test]
async fn stream_nonexistent(content_store: Arc<dyn ContentStore>) {
    let result = content_store.stream_read("images/abc/layer", None).await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

/// An empty range of a missing key is still a missing key.
#[apply(content_stores)]
#[tokio::test]
async fn stream_empty_range_nonexistent(content_store: Arc<dyn ContentStore>) {
    let result = content_store
        .stream_read("images/abc/layer", Some(0..0))
        .await;
    assert!(matches!(result, Err(Error::NotFound(_))));
}

/// Put content, check it exists, get it back.
#[apply(content_stores)]
#[tokio::test]
async fn put_exists_get(content_store: Arc<dyn ContentStore>) {
    let content = Bytes::from_static(b"[\"abc\"]");
    content_store
        .put_content("images/abc/ancestry", content.clone())
        .await
        .expect("put must succeed");

    assert!(content_store
        .exists("images/abc/ancestry")
        .await
        .expect("must not fail"));
    assert_eq!(
        content,
        content_store
            .get_content("images/abc/ancestry")
            .await
            .expect("get must succeed")
    );
    assert_eq!(
        content.len() as u64,
        content_store.size("images/abc/ancestry").await.unwrap()
    );
}

/// Empty content is content, not a missing key.
#[apply(content_stores)]
#[tokio::test]
async fn put_get_empty(content_store: Arc<dyn ContentStore>) {
    content_store
        .put_content("images/abc/_files", Bytes::new())
        .await
        .expect("put must succeed");

    assert!(content_store.exists("images/abc/_files").await.unwrap());
    assert!(content_store
        .get_content("images/abc/_files")
        .await
        .unwrap()
        .is_empty());
}

/// Put a blob, and stream it back, in full and in ranges.
#[apply(content_stores)]
#[tokio::test]
async fn stream_read(content_store: Arc<dyn ContentStore>) {
    let blob = blob_of_size(200_001);
    content_store
        .put_content("images/abc/layer", blob.clone())
        .await
        .expect("put must succeed");

    let full: Vec<Bytes> = content_store
        .stream_read("images/abc/layer", None)
        .await
        .expect("must open")
        .try_collect()
        .await
        .expect("must read");
    assert_eq!(blob, full.concat());

    let ranged: Vec<Bytes> = content_store
        .stream_read("images/abc/layer", Some(1000..150_000))
        .await
        .expect("must open")
        .try_collect()
        .await
        .expect("must read");
    assert_eq!(blob.slice(1000..150_000), ranged.concat());
}

/// Removing a key removes exactly that key, removing a prefix removes
/// everything below it.
#[apply(content_stores)]
#[tokio::test]
async fn remove(content_store: Arc<dyn ContentStore>) {
    for path in ["images/abc/json", "images/abc/layer", "images/abd/json"] {
        content_store
            .put_content(path, Bytes::from_static(b"{}"))
            .await
            .unwrap();
    }

    content_store
        .remove("images/abc/json")
        .await
        .expect("must remove key");
    assert!(!content_store.exists("images/abc/json").await.unwrap());
    assert!(content_store.exists("images/abc/layer").await.unwrap());

    content_store
        .remove("images/abc")
        .await
        .expect("must remove directory");
    assert!(!content_store.exists("images/abc/layer").await.unwrap());
    assert!(content_store.exists("images/abd/json").await.unwrap());

    assert!(matches!(
        content_store.remove("images/abc").await,
        Err(Error::NotFound(_))
    ));
}

/// Listing a directory yields its direct children, keys and
/// subdirectories alike.
#[apply(content_stores)]
#[tokio::test]
async fn list_directory(content_store: Arc<dyn ContentStore>) {
    for path in [
        "images/abc/json",
        "images/abc/layer",
        "images/abc/sub/deeper",
        "images/abd/json",
    ] {
        content_store
            .put_content(path, Bytes::from_static(b"{}"))
            .await
            .unwrap();
    }

    assert_eq!(
        vec!["images/abc/json", "images/abc/layer", "images/abc/sub"],
        content_store
            .list_directory("images/abc")
            .await
            .expect("must list")
    );
    assert_eq!(
        vec!["images/abc", "images/abd"],
        content_store
            .list_directory("images/")
            .await
            .expect("must list")
    );
    assert_eq!(
        vec!["images"],
        content_store.list_directory("").await.expect("must list")
    );

    assert!(matches!(
        content_store.list_directory("images/nope").await,
        Err(Error::NotFound(_))
    ));
}
