//! Log record type and the command payload it carries.

use std::fmt;

use crate::protocol::{LeaderId, TailBitmap};

use serde::{Deserialize, Serialize};

/// A state-machine command. The engine treats commands opaquely except for
/// the interference relation; the supplied command type is `set(key, value)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cmd {
    pub op: String,
    pub key: String,
    pub v_i64: i64,
}

impl Cmd {
    /// Creates a command with an i64 value, e.g. `Cmd::new_i64("set", "x", 5)`.
    pub fn new_i64(op: &str, key: &str, v: i64) -> Self {
        Cmd {
            op: op.into(),
            key: key.into(),
            v_i64: v,
        }
    }

    /// True iff default-constructed (no operation).
    pub fn is_empty(&self) -> bool {
        self.op.is_empty()
    }

    /// Two commands interfere iff they touch overlapping state; for `set`
    /// commands that means the same key.
    pub fn interferes(&self, other: &Cmd) -> bool {
        !self.is_empty() && !other.is_empty() && self.key == other.key
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}({}, {})", self.op, self.key, self.v_i64)
    }
}

/// One replicated log entry. Never mutated after creation; an
/// empty (default) record marks a hole in the log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// The leader id under which this record was authored.
    pub author: LeaderId,

    /// Absolute log position.
    pub seq: i64,

    pub cmd: Cmd,

    /// Seqs of earlier interfering records subsumed by this one; contains
    /// this record's own seq iff an earlier interfering record existed.
    pub overrides: TailBitmap,

    /// Seqs that must precede this record in any execution order; defaults
    /// to everything below the author's log window.
    pub depends: TailBitmap,
}

impl Record {
    /// Creates a record with empty overrides/depends; the author fills
    /// those in right after.
    pub fn new(author: LeaderId, seq: i64, cmd: Cmd) -> Self {
        Record {
            author,
            seq,
            cmd,
            overrides: TailBitmap::default(),
            depends: TailBitmap::default(),
        }
    }

    /// True iff default-constructed: no author and no command.
    pub fn is_empty(&self) -> bool {
        self.author == LeaderId::default() && self.cmd.is_empty()
    }

    /// Records interfere iff their commands do; holes interfere with
    /// nothing.
    pub fn interferes(&self, other: &Record) -> bool {
        self.cmd.interferes(&other.cmd)
    }

    /// Compact rendering, e.g. `<001#001:006{set(x, 6)}-0→0>`; a hole
    /// renders as `<>`.
    pub fn short_str(&self) -> String {
        if self.is_empty() {
            return "<>".into();
        }
        format!(
            "<{}:{:0>3}{{{}}}-{}→{}>",
            self.author.short_str(),
            self.seq,
            self.cmd,
            self.overrides.short_str(),
            self.depends.short_str(),
        )
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.short_str())
    }
}

/// Renders a slice of records, e.g. `[<>, <001#001:007{set(x, 7)}-0→0>]`.
pub fn records_short_str(records: &[Record]) -> String {
    let strs: Vec<String> = records.iter().map(Record::short_str).collect();
    format!("[{}]", strs.join(", "))
}
