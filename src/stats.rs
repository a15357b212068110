use crate::classify::{AlterAction, StatementKind, Target};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum StatKey {
    UseDb,
    Deleting,
    Inserting,
    Updating,
    Selecting,
    AlterTable,
    Renaming,
    CreateIndex,
    DropIndex,
    AddColumn,
    DropColumn,
    ChangeColumn,
    AlterOption,
    AlterConvert,
    CreateTable,
    DropTable,
    CreateDb,
    DropDb,
    Truncating,
}

impl StatKey {
    pub const ALL: [StatKey; 19] = [
        StatKey::UseDb,
        StatKey::Deleting,
        StatKey::Inserting,
        StatKey::Updating,
        StatKey::Selecting,
        StatKey::AlterTable,
        StatKey::Renaming,
        StatKey::CreateIndex,
        StatKey::DropIndex,
        StatKey::AddColumn,
        StatKey::DropColumn,
        StatKey::ChangeColumn,
        StatKey::AlterOption,
        StatKey::AlterConvert,
        StatKey::CreateTable,
        StatKey::DropTable,
        StatKey::CreateDb,
        StatKey::DropDb,
        StatKey::Truncating,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StatKey::UseDb => "usedb",
            StatKey::Deleting => "deleting",
            StatKey::Inserting => "inserting",
            StatKey::Updating => "updating",
            StatKey::Selecting => "selecting",
            StatKey::AlterTable => "altertable",
            StatKey::Renaming => "renaming",
            StatKey::CreateIndex => "createindex",
            StatKey::DropIndex => "dropindex",
            StatKey::AddColumn => "addcolumn",
            StatKey::DropColumn => "dropcolumn",
            StatKey::ChangeColumn => "changecolumn",
            StatKey::AlterOption => "alteroption",
            StatKey::AlterConvert => "alterconvert",
            StatKey::CreateTable => "createtable",
            StatKey::DropTable => "droptable",
            StatKey::CreateDb => "createdb",
            StatKey::DropDb => "dropdb",
            StatKey::Truncating => "truncating",
        }
    }

    pub fn for_kind(kind: StatementKind) -> Option<StatKey> {
        match kind {
            StatementKind::Use => Some(StatKey::UseDb),
            StatementKind::Insert => Some(StatKey::Inserting),
            StatementKind::Update => Some(StatKey::Updating),
            StatementKind::Delete => Some(StatKey::Deleting),
            StatementKind::Select => Some(StatKey::Selecting),
            StatementKind::CreateTable => Some(StatKey::CreateTable),
            StatementKind::AlterTable => Some(StatKey::AlterTable),
            StatementKind::DropTable => Some(StatKey::DropTable),
            StatementKind::RenameTable => Some(StatKey::Renaming),
            StatementKind::Truncate => Some(StatKey::Truncating),
            StatementKind::CreateIndex => Some(StatKey::CreateIndex),
            StatementKind::DropIndex => Some(StatKey::DropIndex),
            StatementKind::CreateDatabase => Some(StatKey::CreateDb),
            StatementKind::DropDatabase => Some(StatKey::DropDb),
            StatementKind::Set
            | StatementKind::Show
            | StatementKind::Transaction
            | StatementKind::Unsupported
            | StatementKind::Invalid => None,
        }
    }

    pub fn for_action(action: &AlterAction) -> Option<StatKey> {
        match action {
            AlterAction::AddColumn(_) => Some(StatKey::AddColumn),
            AlterAction::DropColumn(_) => Some(StatKey::DropColumn),
            AlterAction::ModifyColumn(_)
            | AlterAction::ChangeColumn { .. }
            | AlterAction::RenameColumn { .. } => Some(StatKey::ChangeColumn),
            AlterAction::AddIndex(_) | AlterAction::AddPrimaryKey => Some(StatKey::CreateIndex),
            AlterAction::DropIndex(_) | AlterAction::DropPrimaryKey => Some(StatKey::DropIndex),
            AlterAction::RenameTable(_) => Some(StatKey::Renaming),
            AlterAction::TableOption(_) => Some(StatKey::AlterOption),
            AlterAction::ConvertCharset => Some(StatKey::AlterConvert),
            AlterAction::Other(_) => None,
        }
    }
}

/// Counts per key. Not synchronized: each run owns one and merges it into
/// the engine's accumulator when it finishes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Statistics {
    counts: BTreeMap<StatKey, u64>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, key: StatKey) {
        *self.counts.entry(key).or_insert(0) += 1;
    }

    /// Counts the statement kind and, for ALTER TABLE, each sub-action.
    /// Standalone CREATE/DROP INDEX are counted once, by kind.
    pub fn record_target(&mut self, target: &Target) {
        if let Some(key) = StatKey::for_kind(target.kind) {
            self.record(key);
        }
        if target.kind == StatementKind::AlterTable {
            for action in &target.actions {
                if let Some(key) = StatKey::for_action(action) {
                    self.record(key);
                }
            }
        }
    }

    pub fn get(&self, key: StatKey) -> u64 {
        self.counts.get(&key).copied().unwrap_or(0)
    }

    pub fn merge(&mut self, other: &Statistics) {
        for (key, n) in &other.counts {
            *self.counts.entry(*key).or_insert(0) += n;
        }
    }

    pub fn reset(&mut self) {
        self.counts.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.counts.values().all(|n| *n == 0)
    }

    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        StatKey::ALL
            .iter()
            .map(|key| (key.as_str(), self.get(*key)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify_unit;
    use crate::split::split;

    #[test]
    fn counts_kinds_and_alter_actions() {
        let mut stats = Statistics::new();
        for unit in split(
            "use test_inc; insert into t1 values(1); \
             alter table t1 add column c2 int, add column c3 int, drop column c1; \
             create index idx on t1(c2)",
        ) {
            stats.record_target(&classify_unit(&unit));
        }
        assert_eq!(stats.get(StatKey::UseDb), 1);
        assert_eq!(stats.get(StatKey::Inserting), 1);
        assert_eq!(stats.get(StatKey::AlterTable), 1);
        assert_eq!(stats.get(StatKey::AddColumn), 2);
        assert_eq!(stats.get(StatKey::DropColumn), 1);
        assert_eq!(stats.get(StatKey::CreateIndex), 1);
        assert_eq!(stats.snapshot()["addcolumn"], 2);
        assert_eq!(stats.snapshot().len(), StatKey::ALL.len());
    }

    #[test]
    fn merge_and_reset() {
        let mut a = Statistics::new();
        a.record(StatKey::Deleting);
        let mut b = Statistics::new();
        b.record(StatKey::Deleting);
        b.record(StatKey::Truncating);
        a.merge(&b);
        assert_eq!(a.get(StatKey::Deleting), 2);
        assert_eq!(a.get(StatKey::Truncating), 1);
        a.reset();
        assert!(a.is_empty());
    }
}
