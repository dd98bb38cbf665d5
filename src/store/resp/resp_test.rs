use std::time::Duration;

use bytes::Bytes;

use super::cluster::SlotTable;
use super::command;
use super::node::parse_scan_reply;
use super::pubsub::channel_prefix;
use super::pubsub::notification_kind;
use super::pubsub::parse_push;
use super::sentinel::parse_master_addr;
use super::value::error_redirect;
use super::value::parse_redirect;
use super::value::Redirect;
use super::RespValue;
use crate::store::NotificationKind;
use crate::Error;
use crate::ProtocolError;

fn bulk(s: &str) -> RespValue {
    RespValue::Bulk(Bytes::copy_from_slice(s.as_bytes()))
}

fn args(command: command::Command) -> Vec<Bytes> {
    command.into_args()
}

#[test]
fn test_set_with_ttl_uses_millisecond_expiry() {
    let cmd = command::set(Bytes::from("k"), Bytes::from("v"), Some(Duration::from_secs(2)));
    assert_eq!(
        args(cmd),
        vec![
            Bytes::from("SET"),
            Bytes::from("k"),
            Bytes::from("v"),
            Bytes::from("PX"),
            Bytes::from("2000"),
        ]
    );

    let cmd = command::set(Bytes::from("k"), Bytes::from("v"), None);
    assert_eq!(args(cmd).len(), 3);
}

#[test]
fn test_sub_millisecond_ttl_rounds_up() {
    let cmd = command::set(Bytes::from("k"), Bytes::from("v"), Some(Duration::from_micros(10)));
    assert_eq!(args(cmd).last(), Some(&Bytes::from("1")));
}

#[test]
fn test_command_routing_metadata() {
    let get = command::get(Bytes::from("user:1"));
    assert!(get.is_read_only());
    assert_eq!(get.first_key(), Some(&Bytes::from("user:1")));

    let del = command::del(vec![Bytes::from("a"), Bytes::from("b")]);
    assert!(!del.is_read_only());
    assert_eq!(del.first_key(), Some(&Bytes::from("a")));

    assert_eq!(command::ping().first_key(), None);
}

#[test]
fn test_scan_command_shape() {
    let cmd = command::scan(Bytes::from("0"), Bytes::from("key*"), 100);
    assert_eq!(
        args(cmd),
        vec![
            Bytes::from("SCAN"),
            Bytes::from("0"),
            Bytes::from("MATCH"),
            Bytes::from("key*"),
            Bytes::from("COUNT"),
            Bytes::from("100"),
        ]
    );
}

#[test]
fn test_reply_conversions() {
    assert!(RespValue::Simple("OK".into()).expect_ok("SET").is_ok());
    assert!(RespValue::Nil.expect_ok("SET").is_err());
    assert_eq!(RespValue::Nil.into_optional_bytes("GET").unwrap(), None);
    assert_eq!(RespValue::Integer(3).into_integer("DEL").unwrap(), 3);

    let err = RespValue::Error("WRONGTYPE bad".into()).into_optional_bytes("GET").unwrap_err();
    assert!(matches!(err, Error::Protocol(ProtocolError::Server(m)) if m == "WRONGTYPE bad"));

    let err = bulk("x").into_integer("DEL").unwrap_err();
    assert!(matches!(err, Error::Protocol(ProtocolError::UnexpectedReply { command: "DEL", .. })));
}

#[test]
fn test_parse_redirects() {
    assert_eq!(
        parse_redirect("MOVED 3999 127.0.0.1:6381"),
        Some(Redirect::Moved {
            slot: 3999,
            endpoint: "127.0.0.1:6381".into()
        })
    );
    assert_eq!(
        RespValue::Error("ASK 3999 10.0.0.2:7000".into()).redirect(),
        Some(Redirect::Ask {
            slot: 3999,
            endpoint: "10.0.0.2:7000".into()
        })
    );
    assert_eq!(parse_redirect("ERR unknown command"), None);
    assert_eq!(parse_redirect("MOVED notaslot host:1"), None);

    let err: Error = ProtocolError::Server("MOVED 1 h:1".into()).into();
    assert!(error_redirect(&err).is_some());
}

#[test]
fn test_parse_scan_reply() {
    let reply = RespValue::Array(vec![
        bulk("42"),
        RespValue::Array(vec![bulk("key1"), bulk("key2")]),
    ]);
    let (cursor, keys) = parse_scan_reply(reply).unwrap();
    assert_eq!(cursor, Bytes::from("42"));
    assert_eq!(keys, vec![Bytes::from("key1"), Bytes::from("key2")]);

    assert!(parse_scan_reply(RespValue::Array(vec![bulk("0")])).is_err());
}

#[test]
fn test_keyspace_event_mapping() {
    assert_eq!(notification_kind(b"set"), Some(NotificationKind::Set { value: None }));
    assert_eq!(notification_kind(b"rename_to"), Some(NotificationKind::Set { value: None }));
    assert_eq!(notification_kind(b"del"), Some(NotificationKind::Del));
    assert_eq!(notification_kind(b"expired"), Some(NotificationKind::Expired));
    assert_eq!(notification_kind(b"evicted"), Some(NotificationKind::Expired));
    assert_eq!(notification_kind(b"expire"), None);
    assert_eq!(notification_kind(b"lpush"), None);
}

#[test]
fn test_parse_pmessage_push() {
    let prefix = channel_prefix(2);
    assert_eq!(prefix, Bytes::from("__keyspace@2__:"));

    let frame = RespValue::Array(vec![
        bulk("pmessage"),
        bulk("__keyspace@2__:app/*"),
        bulk("__keyspace@2__:app/key1"),
        bulk("del"),
    ]);
    let notification = parse_push(&frame, &prefix).unwrap();
    assert_eq!(notification.key, Bytes::from("app/key1"));
    assert_eq!(notification.kind, NotificationKind::Del);

    let confirmation = RespValue::Array(vec![
        bulk("psubscribe"),
        bulk("__keyspace@2__:app/*"),
        RespValue::Integer(1),
    ]);
    assert!(parse_push(&confirmation, &prefix).is_none());

    let other_db = RespValue::Array(vec![
        bulk("pmessage"),
        bulk("__keyspace@0__:*"),
        bulk("__keyspace@0__:app/key1"),
        bulk("set"),
    ]);
    assert!(parse_push(&other_db, &prefix).is_none());
}

#[test]
fn test_slot_table_lookup() {
    let reply = RespValue::Array(vec![
        RespValue::Array(vec![
            RespValue::Integer(8192),
            RespValue::Integer(16383),
            RespValue::Array(vec![bulk("10.0.0.2"), RespValue::Integer(7001)]),
        ]),
        RespValue::Array(vec![
            RespValue::Integer(0),
            RespValue::Integer(8191),
            RespValue::Array(vec![bulk(""), RespValue::Integer(7000), bulk("node-id")]),
            RespValue::Array(vec![bulk("10.0.0.3"), RespValue::Integer(7002)]),
        ]),
    ]);
    let table = SlotTable::parse(reply, "10.0.0.1:7000").unwrap();

    let low = table.lookup(0).unwrap();
    assert_eq!(low.master, "10.0.0.1:7000");
    assert_eq!(low.replicas, vec!["10.0.0.3:7002".to_string()]);
    assert_eq!(table.lookup(8191).unwrap().master, "10.0.0.1:7000");
    assert_eq!(table.lookup(8192).unwrap().master, "10.0.0.2:7001");
    assert_eq!(table.lookup(16383).unwrap().master, "10.0.0.2:7001");
    assert_eq!(table.masters(), vec!["10.0.0.1:7000".to_string(), "10.0.0.2:7001".to_string()]);
}

#[test]
fn test_slot_table_gap_is_unserved() {
    let reply = RespValue::Array(vec![RespValue::Array(vec![
        RespValue::Integer(100),
        RespValue::Integer(200),
        RespValue::Array(vec![bulk("h"), RespValue::Integer(1)]),
    ])]);
    let table = SlotTable::parse(reply, "h:1").unwrap();
    assert!(table.lookup(99).is_none());
    assert!(table.lookup(150).is_some());
    assert!(table.lookup(201).is_none());
}

#[test]
fn test_parse_sentinel_master_addr() {
    let reply = RespValue::Array(vec![bulk("10.0.0.9"), bulk("6379")]);
    assert_eq!(parse_master_addr(reply).unwrap(), Some("10.0.0.9:6379".to_string()));
    assert_eq!(parse_master_addr(RespValue::Nil).unwrap(), None);
    assert!(parse_master_addr(RespValue::Error("ERR no such master".into())).is_err());
}
