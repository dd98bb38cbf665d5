//! End-to-end walk through the public API over the in-process store

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use d_keyval::with_ttl;
use d_keyval::ChangeType;
use d_keyval::Connection;
use d_keyval::ConnectionBuilder;
use d_keyval::MemoryStore;
use d_keyval::WatchError;
use d_keyval::WatchResponse;
use d_keyval::WatcherState;
use tokio::sync::mpsc;

fn open() -> Connection {
    ConnectionBuilder::new()
        .request_timeout(Duration::from_secs(1))
        .with_client(Arc::new(MemoryStore::new()))
}

async fn drain(rx: &mut mpsc::Receiver<WatchResponse>) -> Vec<WatchResponse> {
    let mut out = Vec::new();
    while let Ok(Some(response)) = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
        out.push(response);
    }
    out
}

#[tokio::test(start_paused = true)]
async fn test_put_expire_list_delete_scenario() {
    let conn = open();
    let broker = conn.new_broker("");

    broker.put("key1", "val 1", &[]).await.unwrap();
    broker.put("key2", "val 2", &[]).await.unwrap();
    broker
        .put("key3", "val 3", &[with_ttl(Duration::from_secs(1))])
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    let key1 = broker.get_value("key1").await.unwrap().unwrap();
    assert_eq!(key1.value, Bytes::from("val 1"));
    assert!(broker.get_value("key3").await.unwrap().is_none());
    assert!(broker.get_value("key").await.unwrap().is_none());

    let listed: BTreeSet<Bytes> = broker
        .list_keys("key")
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap()
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    assert_eq!(listed, BTreeSet::from([Bytes::from("key1"), Bytes::from("key2")]));

    assert!(broker.delete("key").await.unwrap());
    assert!(broker
        .list_keys("key")
        .await
        .unwrap()
        .collect_all()
        .await
        .unwrap()
        .is_empty());
    assert!(broker.get_value("key1").await.unwrap().is_none());

    conn.close().await;
    assert!(broker.delete("key").await.unwrap_err().is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_watcher_observes_scenario_in_order() {
    let conn = open();
    let broker = conn.new_broker("");
    let watcher = conn.new_watcher("");

    let (tx, mut rx) = mpsc::channel(64);
    watcher.watch(tx, ["key"]).await.unwrap();

    broker.put("key1", "val 1", &[]).await.unwrap();
    broker
        .put("key3", "val 3", &[with_ttl(Duration::from_secs(1))])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    broker.delete("key").await.unwrap();

    let mut txn = broker.new_txn();
    txn.put("key101", "val 101")
        .put("key102", "val 102")
        .delete("key101");
    txn.commit().await.unwrap();

    let events: Vec<(ChangeType, Bytes)> = drain(&mut rx)
        .await
        .into_iter()
        .map(|response| {
            let event = response.unwrap();
            (event.change_type, event.key)
        })
        .collect();

    let for_key = |key: &str| -> Vec<ChangeType> {
        events
            .iter()
            .filter(|(_, k)| k == &Bytes::copy_from_slice(key.as_bytes()))
            .map(|(change, _)| *change)
            .collect()
    };
    assert_eq!(for_key("key1"), vec![ChangeType::Put, ChangeType::Delete]);
    assert_eq!(for_key("key3"), vec![ChangeType::Put, ChangeType::Delete]);
    assert_eq!(for_key("key101"), vec![ChangeType::Put, ChangeType::Delete]);
    assert_eq!(for_key("key102"), vec![ChangeType::Put]);

    conn.close().await;
    assert_eq!(watcher.state(), WatcherState::Closed);
    assert_eq!(drain(&mut rx).await, vec![Err(WatchError::Closed)]);
    assert_eq!(rx.recv().await, None);
}

#[tokio::test]
async fn test_connections_over_one_store_see_each_other() {
    let store = MemoryStore::new();
    let writer = ConnectionBuilder::new().with_client(Arc::new(store.clone()));
    let reader = ConnectionBuilder::new().with_client(Arc::new(store));

    let (tx, mut rx) = mpsc::channel(8);
    reader.new_watcher("").watch(tx, ["shared/"]).await.unwrap();

    writer
        .new_broker("shared/")
        .put("k", "from writer", &[])
        .await
        .unwrap();

    let entry = reader
        .new_broker("shared/")
        .get_value("k")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.value, Bytes::from("from writer"));

    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(event.change_type, ChangeType::Put);
    assert_eq!(event.key, Bytes::from("shared/k"));
}
