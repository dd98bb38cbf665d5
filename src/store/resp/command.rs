use std::time::Duration;

use bytes::Bytes;

/// A command ready to be framed: name followed by its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: &'static str,
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            args: vec![Bytes::from_static(name.as_bytes())],
        }
    }

    pub fn arg(
        mut self,
        arg: impl Into<Bytes>,
    ) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn arg_int(
        self,
        n: impl ToString,
    ) -> Self {
        self.arg(n.to_string())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// First key argument, used for cluster slot routing
    pub fn first_key(&self) -> Option<&Bytes> {
        match self.name {
            "GET" | "SET" | "DEL" => self.args.get(1),
            _ => None,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.name, "GET" | "SCAN" | "PING")
    }

    pub fn into_args(self) -> Vec<Bytes> {
        self.args
    }
}

pub fn get(key: Bytes) -> Command {
    Command::new("GET").arg(key)
}

/// `SET key value [PX ttl]`; the value, revision and expiry change together
pub fn set(
    key: Bytes,
    value: Bytes,
    ttl: Option<Duration>,
) -> Command {
    let command = Command::new("SET").arg(key).arg(value);
    match ttl {
        Some(ttl) => command.arg("PX").arg_int(ttl.as_millis().max(1)),
        None => command,
    }
}

pub fn del(keys: Vec<Bytes>) -> Command {
    keys.into_iter().fold(Command::new("DEL"), |command, key| command.arg(key))
}

pub fn scan(
    cursor: Bytes,
    pattern: Bytes,
    count: usize,
) -> Command {
    Command::new("SCAN")
        .arg(cursor)
        .arg("MATCH")
        .arg(pattern)
        .arg("COUNT")
        .arg_int(count)
}

pub fn auth(password: &str) -> Command {
    Command::new("AUTH").arg(password.to_string())
}

pub fn select(db: u32) -> Command {
    Command::new("SELECT").arg_int(db)
}

pub fn readonly() -> Command {
    Command::new("READONLY")
}

pub fn ping() -> Command {
    Command::new("PING")
}

pub fn multi() -> Command {
    Command::new("MULTI")
}

pub fn exec() -> Command {
    Command::new("EXEC")
}

pub fn cluster_slots() -> Command {
    Command::new("CLUSTER").arg("SLOTS")
}

pub fn sentinel_master_addr(master_name: &str) -> Command {
    Command::new("SENTINEL")
        .arg("get-master-addr-by-name")
        .arg(master_name.to_string())
}

pub fn config_set_keyspace_events(flags: &'static str) -> Command {
    Command::new("CONFIG")
        .arg("SET")
        .arg("notify-keyspace-events")
        .arg(flags)
}

pub fn psubscribe(patterns: Vec<Bytes>) -> Command {
    patterns
        .into_iter()
        .fold(Command::new("PSUBSCRIBE"), |command, pattern| command.arg(pattern))
}

pub fn asking() -> Command {
    Command::new("ASKING")
}
