use std::collections::HashSet;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;

use crate::constants::SCAN_PAGE_SIZE;
use crate::store::MockStoreClient;
use crate::store::ScanCursor;
use crate::store::ScanPage;
use crate::store::ScannedKey;
use crate::store::StoredValue;
use crate::test_utils::connection_with;
use crate::test_utils::memory_connection;
use crate::ConnectionError;

fn scanned(key: &str) -> ScannedKey {
    ScannedKey {
        key: Bytes::copy_from_slice(key.as_bytes()),
        revision: 0,
    }
}

fn resume_at(position: &str) -> ScanCursor {
    ScanCursor {
        shard: 0,
        position: Bytes::copy_from_slice(position.as_bytes()),
    }
}

#[tokio::test]
async fn test_list_spans_several_pages_without_duplicates() {
    let (conn, _store) = memory_connection();
    let broker = conn.new_broker("");
    let total = SCAN_PAGE_SIZE * 2 + 7;
    for n in 0..total {
        broker.put(format!("key{n:04}"), "v", &[]).await.unwrap();
    }

    let listed = broker.list_keys("key").await.unwrap().collect_all().await.unwrap();
    let unique: HashSet<Bytes> = listed.iter().map(|(key, _)| key.clone()).collect();
    assert_eq!(listed.len(), total);
    assert_eq!(unique.len(), total);
}

#[tokio::test]
async fn test_keys_repeated_across_pages_are_yielded_once() {
    let mut mock = MockStoreClient::new();
    mock.expect_scan().returning(|_, cursor, _| {
        if cursor.position.is_empty() {
            Ok(ScanPage {
                keys: vec![scanned("a"), scanned("b")],
                next: Some(resume_at("7")),
            })
        } else {
            Ok(ScanPage {
                keys: vec![scanned("b"), scanned("c")],
                next: None,
            })
        }
    });
    let conn = connection_with(mock, Duration::from_secs(1));

    let listed = conn
        .new_broker("")
        .list_keys("")
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    let keys: Vec<Bytes> = listed.into_iter().map(|(key, _)| key).collect();
    assert_eq!(keys, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
}

#[tokio::test]
async fn test_failed_page_can_be_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let mut mock = MockStoreClient::new();
    mock.expect_scan().returning(move |_, cursor, _| {
        let call = counter.fetch_add(1, Ordering::SeqCst);
        match call {
            0 => Ok(ScanPage {
                keys: vec![scanned("a")],
                next: Some(resume_at("9")),
            }),
            1 => Err(ConnectionError::Lost("reset".into()).into()),
            _ => {
                assert_eq!(cursor.position, Bytes::from("9"));
                Ok(ScanPage {
                    keys: vec![scanned("b")],
                    next: None,
                })
            }
        }
    });
    let conn = connection_with(mock, Duration::from_secs(1));

    let mut iter = conn.new_broker("").list_keys("").await.unwrap();
    assert_eq!(iter.next().await.unwrap().unwrap().0, Bytes::from("a"));
    assert!(iter.next().await.unwrap_err().is_retryable());
    assert_eq!(iter.next().await.unwrap().unwrap().0, Bytes::from("b"));
    assert!(iter.next().await.unwrap().is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_key_value_iterator_skips_vanished_keys() {
    let mut mock = MockStoreClient::new();
    mock.expect_scan().returning(|_, _, _| {
        Ok(ScanPage {
            keys: vec![scanned("gone"), scanned("kept")],
            next: None,
        })
    });
    mock.expect_get().returning(|key| {
        if key == Bytes::from("kept") {
            Ok(Some(StoredValue {
                value: Bytes::from("v"),
                revision: 0,
            }))
        } else {
            Ok(None)
        }
    });
    let conn = connection_with(mock, Duration::from_secs(1));

    let entries = conn
        .new_broker("")
        .list_values("")
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, Bytes::from("kept"));
}

#[tokio::test]
async fn test_into_stream_yields_every_entry() {
    let (conn, _store) = memory_connection();
    let broker = conn.new_broker("ns/");
    broker.put("x1", "1", &[]).await.unwrap();
    broker.put("x2", "2", &[]).await.unwrap();

    let keys: Vec<Bytes> = broker
        .list_keys("x")
        .await
        .unwrap()
        .into_stream()
        .map(|item| item.unwrap().0)
        .collect()
        .await;
    assert_eq!(keys, vec![Bytes::from("x1"), Bytes::from("x2")]);

    let values: Vec<_> = broker
        .list_values("x")
        .await
        .unwrap()
        .into_stream()
        .collect()
        .await;
    assert_eq!(values.len(), 2);
    assert!(values.iter().all(|entry| entry.is_ok()));
}

#[tokio::test]
async fn test_stream_ends_after_error() {
    let mut mock = MockStoreClient::new();
    mock.expect_scan().returning(|_, cursor, _| {
        if cursor.position.is_empty() {
            Ok(ScanPage {
                keys: vec![scanned("a")],
                next: Some(resume_at("1")),
            })
        } else {
            Err(ConnectionError::Lost("reset".into()).into())
        }
    });
    let conn = connection_with(mock, Duration::from_secs(1));

    let items: Vec<_> = conn
        .new_broker("")
        .list_keys("")
        .await
        .unwrap()
        .into_stream()
        .collect()
        .await;
    assert_eq!(items.len(), 2);
    assert!(items[0].is_ok());
    assert!(items[1].is_err());
}

#[tokio::test(start_paused = true)]
async fn test_expired_keys_are_not_listed() {
    let (conn, _store) = memory_connection();
    let broker = conn.new_broker("");
    broker.put("key1", "v", &[]).await.unwrap();
    broker
        .put("key3", "v", &[super::with_ttl(Duration::from_secs(1))])
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(2)).await;
    let listed = broker.list_keys("key").await.unwrap().collect_all().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].0, Bytes::from("key1"));
}
